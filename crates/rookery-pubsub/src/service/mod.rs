//! The PubSub service: stanza entry points and lifecycle.
//!
//! One instance per service address. IQ dispatch lives in `dispatch`;
//! the request handlers are split by privilege surface into `owner`,
//! `subscriber`, and `publisher`.

mod dispatch;
mod owner;
mod publisher;
mod subscriber;

use std::collections::HashSet;
use std::sync::Arc;

use jid::{BareJid, Jid};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::batcher::PersistenceBatcher;
use crate::context::ServiceContext;
use crate::error::PubSubError;
use crate::forms::{SubmittedForm, FORM_TYPE_SUBSCRIBE_AUTHORIZATION};
use crate::presence::PresenceTracker;
use crate::stanza::Stanza;
use crate::store::NodeStore;

/// A running PubSub service.
pub struct PubSubService {
    ctx: ServiceContext,
    store: NodeStore,
    presence: PresenceTracker,
    batcher: Arc<PersistenceBatcher>,
    shutdown: CancellationToken,
    flush_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PubSubService {
    /// Build a service from its context. Call [`start`](Self::start)
    /// once the outer server is ready to route stanzas.
    pub fn new(ctx: ServiceContext) -> Self {
        let store = NodeStore::new(ctx.config.collections_supported, &ctx.config.service_jid);
        let batcher = Arc::new(PersistenceBatcher::new(
            Arc::clone(&ctx.backend),
            ctx.config.flush_batch_size,
        ));
        Self {
            ctx,
            store,
            presence: PresenceTracker::new(),
            batcher,
            shutdown: CancellationToken::new(),
            flush_task: tokio::sync::Mutex::new(None),
        }
    }

    /// The service's own address.
    pub fn service_jid(&self) -> &BareJid {
        &self.ctx.config.service_jid
    }

    /// The node store (read access for embedding servers).
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// The persistence batcher (inspection and tests).
    pub fn batcher(&self) -> &PersistenceBatcher {
        &self.batcher
    }

    /// The presence tracker.
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Start the service: load persisted nodes, spawn the flush
    /// worker, and probe the presence of every presence-gated
    /// subscriber.
    pub async fn start(&self) {
        match self.ctx.backend.load_nodes().await {
            Ok(nodes) => {
                let count = nodes.len();
                for node in nodes {
                    self.store.insert_loaded(node);
                }
                info!(nodes = count, "Loaded persisted nodes");
            }
            Err(e) => warn!(error = %e, "Failed to load persisted nodes"),
        }

        let handle = self
            .batcher
            .spawn(self.ctx.config.flush_period, self.shutdown.clone());
        *self.flush_task.lock().await = Some(handle);

        self.probe_presence_subscribers().await;
        info!(service = %self.ctx.config.service_jid, "PubSub service started");
    }

    /// Stop the flush worker (draining its queues) and the command
    /// manager.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.flush_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Flush worker ended abnormally");
            }
        }
        if let Some(commands) = &self.ctx.commands {
            commands.stop();
        }
        info!(service = %self.ctx.config.service_jid, "PubSub service stopped");
    }

    /// Send a presence probe to each distinct bare JID holding a
    /// presence-gated subscription.
    async fn probe_presence_subscribers(&self) {
        let mut targets: HashSet<BareJid> = HashSet::new();
        for handle in self.store.all() {
            let node = handle.read().await;
            for subscription in node.subscriptions() {
                let gated = node.config.access_model == crate::types::AccessModel::Presence
                    || node.config.presence_based_delivery
                    || subscription.options.presence_based_delivery;
                if gated {
                    targets.insert(subscription.owner.clone());
                }
            }
        }

        debug!(count = targets.len(), "Probing presence-gated subscribers");
        for target in targets {
            let mut probe = Presence::new(PresenceType::Probe);
            probe.from = Some(Jid::from(self.ctx.config.service_jid.clone()));
            probe.to = Some(Jid::from(target));
            probe.id = Some(Uuid::now_v7().to_string());
            self.ctx.router.route(Stanza::Presence(probe));
        }
    }

    /// Handle an inbound presence stanza.
    ///
    /// Available presences update the tracker, unavailable ones remove
    /// the resource; every other presence type belongs to the outer
    /// server's subscription handling.
    #[instrument(skip(self, presence), fields(from = ?presence.from, presence_type = ?presence.type_))]
    pub fn process_presence(&self, presence: &Presence) {
        let Some(from) = presence.from.clone() else {
            debug!("Presence without sender ignored");
            return;
        };
        let Ok(full) = from.try_into_full() else {
            debug!("Bare-JID presence ignored");
            return;
        };

        match presence.type_ {
            PresenceType::None => self.presence.on_available(full, presence.show.clone()),
            PresenceType::Unavailable => self.presence.on_unavailable(&full),
            _ => debug!("Presence type not handled by the engine"),
        }
    }

    /// Handle an inbound message stanza.
    ///
    /// Two cases matter: delivery failures of type error/cancel revoke
    /// every subscription of the bounced address, and normal messages
    /// carrying a subscription-authorization form resolve pending
    /// subscriptions.
    #[instrument(skip(self, message), fields(from = ?message.from, msg_type = ?message.type_))]
    pub async fn process_message(&self, message: &Message) {
        let Some(from) = message.from.clone() else {
            debug!("Message without sender ignored");
            return;
        };

        match message.type_ {
            MessageType::Error => {
                // Any cancel-class bounce revokes the sender's
                // subscriptions, whatever the original payload was.
                let cancel = message
                    .payloads
                    .iter()
                    .any(|p| p.name() == "error" && p.attr("type") == Some("cancel"));
                if cancel {
                    info!(jid = %from, "Cancel bounce, revoking all subscriptions");
                    self.cancel_all_subscriptions(&from.to_bare()).await;
                }
            }
            MessageType::Normal => {
                let form = message
                    .payloads
                    .iter()
                    .filter_map(SubmittedForm::from_element)
                    .find(|f| f.form_type() == Some(FORM_TYPE_SUBSCRIBE_AUTHORIZATION));
                if let Some(form) = form {
                    self.handle_authorization_answer(&form).await;
                }
            }
            _ => {}
        }
    }

    /// Remove every subscription held by the bare JID, across all nodes.
    ///
    /// Node locks are taken and released one at a time; there is no
    /// cross-node transaction.
    pub async fn cancel_all_subscriptions(&self, jid: &BareJid) {
        for handle in self.store.all() {
            let (node_id, removed) = {
                let mut node = handle.write().await;
                (node.node_id.clone(), node.remove_subscriptions_for(jid))
            };
            if removed.is_empty() {
                continue;
            }
            for subscription in removed {
                if let Err(e) = self
                    .ctx
                    .backend
                    .delete_subscription(&node_id, &subscription.id)
                    .await
                {
                    warn!(node = %node_id, error = %e, "Failed to delete subscription record");
                }
            }
        }
    }

    /// Route an IQ reply or error.
    fn route_iq(&self, iq: Iq) {
        self.ctx.router.route(Stanza::Iq(iq));
    }

    /// Route a batch of event messages.
    fn route_messages(&self, messages: Vec<Message>) {
        for message in messages {
            self.ctx.router.route(Stanza::Message(message));
        }
    }

    /// The sender of a request, required for every handler.
    fn sender_of(iq: &Iq) -> Result<Jid, PubSubError> {
        iq.from.clone().ok_or_else(|| PubSubError::bad_request(None))
    }

    /// Whether the bare JID is a service admin.
    fn is_admin(&self, jid: &BareJid) -> bool {
        self.ctx.is_admin(jid)
    }
}
