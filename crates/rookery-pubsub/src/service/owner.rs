//! Owner operations: node creation, configuration, deletion, and
//! affiliated-entity management.

use std::sync::Arc;

use jid::BareJid;
use minidom::Element;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::{Iq, IqType};

use crate::error::{PubSubCondition, PubSubError};
use crate::forms::{expand_short_form, SubmittedForm};
use crate::node::Node;
use crate::stanza::{
    pubsub_envelope, pubsub_owner_envelope, result_iq, NS_PUBSUB, NS_PUBSUB_OWNER,
};
use crate::types::{Affiliation, AssociationPolicy, SubscriptionState};

use super::PubSubService;

/// Length of generated instant-node ids.
const INSTANT_NODE_ID_LEN: usize = 15;

impl PubSubService {
    /// Look up a node or fail with item-not-found.
    pub(super) fn node_or_not_found(
        &self,
        node_id: &str,
    ) -> Result<Arc<RwLock<Node>>, PubSubError> {
        self.store.get(node_id).ok_or_else(PubSubError::item_not_found)
    }

    /// The node attribute of an action element, required.
    pub(super) fn required_node_attr(action: &Element) -> Result<String, PubSubError> {
        action
            .attr("node")
            .map(str::to_string)
            .ok_or_else(|| PubSubError::bad_request(Some(PubSubCondition::NodeIdRequired)))
    }

    // =========================================================================
    // Create (§ node lifecycle)
    // =========================================================================

    /// Create a node, optionally under a parent collection.
    pub(super) async fn handle_create(
        &self,
        iq: &Iq,
        pubsub: &Element,
        create: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        if !self.ctx.can_create_node(&sender_bare) {
            return Err(PubSubError::forbidden());
        }

        let configure = pubsub.get_child("configure", NS_PUBSUB);
        let form = configure
            .and_then(|c| SubmittedForm::find_in(c).or_else(|| expand_short_form(c)));

        let wants_collection = create.attr("type") == Some("collection");
        if wants_collection && !self.ctx.config.collections_supported {
            return Err(PubSubError::unsupported("collections"));
        }

        // Parent: the configured collection, else the root collection.
        let parent_id = match form.as_ref().and_then(|f| f.value("pubsub#collection")) {
            Some(parent) => Some(parent.to_string()),
            None => self.store.root_id().map(str::to_string),
        };
        if let Some(parent_id) = &parent_id {
            let parent = self.node_or_not_found(parent_id)?;
            let parent = parent.read().await;
            if !parent.is_collection() {
                return Err(PubSubError::not_acceptable(None));
            }
        }

        let requested = create.attr("node").map(str::to_string);
        let node_id = match &requested {
            Some(id) => Self::prefixed_node_id(parent_id.as_deref(), id),
            None => {
                if !self.ctx.config.instant_nodes_supported {
                    return Err(PubSubError::not_acceptable(Some(
                        PubSubCondition::NodeIdRequired,
                    )));
                }
                self.generate_instant_node_id(parent_id.as_deref())
            }
        };

        // Association policy only constrains leaves under a real
        // (non-root) parent.
        if let Some(parent_id) = &parent_id {
            if !wants_collection && !self.store.is_root(parent_id) {
                let parent = self.node_or_not_found(parent_id)?;
                let parent = parent.read().await;
                if parent.config.association_policy == AssociationPolicy::Owners
                    && !parent.is_owner(&sender_bare)
                    && !self.is_admin(&sender_bare)
                {
                    return Err(PubSubError::forbidden());
                }
                let cap = parent.config.max_leaf_nodes;
                if cap >= 0 && parent.children().len() as i64 >= cap {
                    return Err(PubSubError::conflict(Some(
                        PubSubCondition::MaxNodesExceeded,
                    )));
                }
            }
        }

        let mut config = if wants_collection {
            self.store.defaults.collection.clone()
        } else {
            self.store.defaults.leaf.clone()
        };
        let mut form_owners = None;
        if let Some(form) = &form {
            form_owners = config.apply_form(form);
        }

        let mut node = if wants_collection {
            Node::new_collection(node_id.clone(), parent_id.clone(), sender_bare.clone(), config)
        } else {
            Node::new_leaf(node_id.clone(), parent_id.clone(), sender_bare.clone(), config)
        };
        if let Some(owners) = form_owners {
            if !owners.is_empty() && node.set_owners(owners).is_err() {
                return Err(PubSubError::not_acceptable(None));
            }
        }

        // Atomic per-id insert; the loser of a race gets conflict.
        let Some(handle) = self.store.insert_new(node) else {
            return Err(PubSubError::conflict(None));
        };

        if let Some(parent_id) = &parent_id {
            if let Some(parent) = self.store.get(parent_id) {
                parent.write().await.add_child(node_id.clone());
            }
        }

        let snapshot = handle.read().await.clone();
        if let Err(e) = self.ctx.backend.save_node(&snapshot).await {
            warn!(node = %node_id, error = %e, "Node save failed, rolling back create");
            self.store.remove(&node_id);
            if let Some(parent_id) = &parent_id {
                if let Some(parent) = self.store.get(parent_id) {
                    parent.write().await.remove_child(&node_id);
                }
            }
            return Err(PubSubError::internal_server_error());
        }

        info!(node = %node_id, creator = %sender_bare, "Node created");

        // Echo the assigned id when it differs from the request.
        let payload = if requested.as_deref() != Some(node_id.as_str()) {
            Some(pubsub_envelope(
                Element::builder("create", NS_PUBSUB)
                    .attr("node", node_id.as_str())
                    .build(),
            ))
        } else {
            None
        };
        Ok(result_iq(iq, payload))
    }

    /// Apply the parent prefix to a node id when it is not already there.
    fn prefixed_node_id(parent_id: Option<&str>, node_id: &str) -> String {
        match parent_id {
            Some(parent) => {
                let prefix = format!("{}/", parent);
                if node_id.starts_with(&prefix) {
                    node_id.to_string()
                } else {
                    format!("{}{}", prefix, node_id)
                }
            }
            None => node_id.to_string(),
        }
    }

    /// Generate a random instant-node id, retrying until unique.
    fn generate_instant_node_id(&self, parent_id: Option<&str>) -> String {
        loop {
            let random: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(INSTANT_NODE_ID_LEN)
                .map(char::from)
                .collect();
            let candidate = Self::prefixed_node_id(parent_id, &random);
            if !self.store.contains(&candidate) {
                return candidate;
            }
        }
    }

    // =========================================================================
    // Configure / default
    // =========================================================================

    /// Return the node's configuration form to an owner.
    pub(super) async fn handle_configure_get(
        &self,
        iq: &Iq,
        configure: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let node_id = Self::required_node_attr(configure)?;
        let handle = self.node_or_not_found(&node_id)?;
        let node = handle.read().await;
        self.require_owner(&node, &sender.to_bare())?;

        let form = node
            .config
            .to_form(node.is_collection(), &node.owner_list(), node.parent.as_deref());
        let payload = pubsub_owner_envelope(
            Element::builder("configure", NS_PUBSUB_OWNER)
                .attr("node", node_id.as_str())
                .append(form)
                .build(),
        );
        Ok(result_iq(iq, Some(payload)))
    }

    /// Apply a submitted configuration form (or its short form).
    pub(super) async fn handle_configure_set(
        &self,
        iq: &Iq,
        configure: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let node_id = Self::required_node_attr(configure)?;
        let handle = self.node_or_not_found(&node_id)?;

        let form = SubmittedForm::find_in(configure).or_else(|| expand_short_form(configure));
        let Some(form) = form else {
            // An empty set is a form cancellation.
            return Ok(result_iq(iq, None));
        };

        let (snapshot, messages) = {
            let mut node = handle.write().await;
            self.require_owner(&node, &sender.to_bare())?;

            let mut config = node.config.clone();
            let new_owners = config.apply_form(&form);
            if let Some(owners) = new_owners {
                if node.set_owners(owners).is_err() {
                    return Err(PubSubError::not_acceptable(None));
                }
            }
            node.config = config;

            let messages =
                node.config_event_messages(&self.ctx.config.service_jid, &self.presence);
            (node.clone(), messages)
        };

        if let Err(e) = self.ctx.backend.save_node(&snapshot).await {
            warn!(node = %node_id, error = %e, "Node save failed after configure");
            return Err(PubSubError::internal_server_error());
        }

        debug!(node = %node_id, "Node reconfigured");
        self.route_messages(messages);
        Ok(result_iq(iq, None))
    }

    /// Return the service default configuration for a node kind.
    pub(super) async fn handle_default(
        &self,
        iq: &Iq,
        default: &Element,
    ) -> Result<Iq, PubSubError> {
        let wants_collection = default.attr("type") == Some("collection");
        if wants_collection && !self.ctx.config.collections_supported {
            return Err(PubSubError::unsupported("collections"));
        }

        let (config, is_collection) = if wants_collection {
            (&self.store.defaults.collection, true)
        } else {
            (&self.store.defaults.leaf, false)
        };
        let form = config.to_form(is_collection, &[], None);
        let payload = pubsub_owner_envelope(
            Element::builder("default", NS_PUBSUB_OWNER)
                .append(form)
                .build(),
        );
        Ok(result_iq(iq, Some(payload)))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a node, cancelling its queued writes and notifying its
    /// subscribers.
    pub(super) async fn handle_delete(
        &self,
        iq: &Iq,
        delete: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let node_id = Self::required_node_attr(delete)?;
        if self.store.is_root(&node_id) {
            return Err(PubSubError::not_allowed(None));
        }
        let handle = self.node_or_not_found(&node_id)?;

        let (parent_id, children, messages) = {
            let node = handle.read().await;
            self.require_owner(&node, &sender.to_bare())?;
            (
                node.parent.clone(),
                node.children().to_vec(),
                node.delete_event_messages(&self.ctx.config.service_jid),
            )
        };

        if let Err(e) = self.ctx.backend.delete_node(&node_id).await {
            warn!(node = %node_id, error = %e, "Backend refused node delete");
            return Err(PubSubError::internal_server_error());
        }

        self.batcher.cancel_queued_items(&node_id);
        self.store.remove(&node_id);

        if let Some(parent_id) = &parent_id {
            if let Some(parent) = self.store.get(parent_id) {
                parent.write().await.remove_child(&node_id);
            }
        }

        // Surviving children of a deleted collection move to the root.
        let root_id = self.store.root_id().map(str::to_string);
        for child_id in children {
            if let Some(child) = self.store.get(&child_id) {
                child.write().await.parent = root_id.clone();
            }
            if let Some(root_id) = &root_id {
                if let Some(root) = self.store.get(root_id) {
                    root.write().await.add_child(child_id.clone());
                }
            }
        }

        info!(node = %node_id, "Node deleted");
        self.route_messages(messages);
        Ok(result_iq(iq, None))
    }

    // =========================================================================
    // Affiliated entities
    // =========================================================================

    /// List every affiliate and its subscriptions for an owner.
    pub(super) async fn handle_entities_get(
        &self,
        iq: &Iq,
        entities: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let node_id = Self::required_node_attr(entities)?;
        let handle = self.node_or_not_found(&node_id)?;
        let node = handle.read().await;
        self.require_owner(&node, &sender.to_bare())?;

        let include_subid = node.config.multiple_subscriptions;
        let mut entities_elem =
            Element::builder("entities", NS_PUBSUB_OWNER).attr("node", node_id.as_str());
        for affiliate in node.affiliates() {
            let subscriptions = node.subscriptions_for(&affiliate.jid);
            if subscriptions.is_empty() {
                entities_elem = entities_elem.append(
                    Element::builder("entity", NS_PUBSUB_OWNER)
                        .attr("jid", affiliate.jid.to_string().as_str())
                        .attr("affiliation", affiliate.affiliation.to_string().as_str())
                        .attr("subscription", "none")
                        .build(),
                );
            } else {
                for subscription in subscriptions {
                    let mut entity = Element::builder("entity", NS_PUBSUB_OWNER)
                        .attr("jid", subscription.jid.to_string().as_str())
                        .attr("affiliation", affiliate.affiliation.to_string().as_str())
                        .attr("subscription", subscription.state.to_string().as_str());
                    if include_subid {
                        entity = entity.attr("subid", subscription.id.as_str());
                    }
                    entities_elem = entities_elem.append(entity.build());
                }
            }
        }

        Ok(result_iq(
            iq,
            Some(pubsub_owner_envelope(entities_elem.build())),
        ))
    }

    /// Apply affiliation and subscription transitions per entity.
    ///
    /// Entries that would strip the node of its only owner fail and
    /// are echoed back with their pre-modification state; every other
    /// entry still takes effect.
    pub(super) async fn handle_entities_modify(
        &self,
        iq: &Iq,
        entities: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let node_id = Self::required_node_attr(entities)?;
        let handle = self.node_or_not_found(&node_id)?;

        struct FailedEntity {
            jid: BareJid,
            prior_affiliation: Affiliation,
        }

        let mut failed: Vec<FailedEntity> = Vec::new();
        let mut affiliation_updates: Vec<(BareJid, Affiliation)> = Vec::new();
        let mut deleted_subscriptions: Vec<String> = Vec::new();
        let mut saved_subscriptions: Vec<crate::subscription::NodeSubscription> = Vec::new();
        let mut messages = Vec::new();

        {
            let mut node = handle.write().await;
            self.require_owner(&node, &sender.to_bare())?;

            for entity in entities.children().filter(|c| c.name() == "entity") {
                let Some(jid) = entity.attr("jid").and_then(|j| j.parse::<BareJid>().ok())
                else {
                    debug!("Entity without a parseable jid skipped");
                    continue;
                };
                let prior_affiliation = node.affiliation_of(&jid);

                if let Some(affiliation) =
                    entity.attr("affiliation").and_then(Affiliation::from_str)
                {
                    if node.set_affiliation(jid.clone(), affiliation).is_err() {
                        failed.push(FailedEntity {
                            jid: jid.clone(),
                            prior_affiliation,
                        });
                    } else {
                        affiliation_updates.push((jid.clone(), affiliation));
                    }
                }

                if let Some(state) = entity.attr("subscription") {
                    let targets: Vec<String> = match entity.attr("subid") {
                        Some(subid) => node
                            .subscription_by_id(subid)
                            .filter(|s| s.owner == jid)
                            .map(|s| vec![s.id.clone()])
                            .unwrap_or_default(),
                        None => node
                            .subscriptions_for(&jid)
                            .into_iter()
                            .map(|s| s.id.clone())
                            .collect(),
                    };
                    for sub_id in targets {
                        match state {
                            "none" => {
                                if let Some(removed) = node.remove_subscription(&sub_id) {
                                    deleted_subscriptions.push(removed.id.clone());
                                    let mut cancelled = removed;
                                    cancelled.state = SubscriptionState::None;
                                    messages.push(node.subscription_state_message(
                                        &self.ctx.config.service_jid,
                                        &cancelled,
                                    ));
                                }
                            }
                            "subscribed" => {
                                if let Some(updated) = node.approve_subscription(&sub_id, true) {
                                    messages.push(node.subscription_state_message(
                                        &self.ctx.config.service_jid,
                                        &updated,
                                    ));
                                    saved_subscriptions.push(updated);
                                }
                            }
                            other => {
                                if let Some(state) = SubscriptionState::from_str(other) {
                                    if let Some(updated) =
                                        node.update_subscription(&sub_id, |s| s.state = state)
                                    {
                                        saved_subscriptions.push(updated);
                                    }
                                } else {
                                    debug!(state = other, "Unknown subscription state skipped");
                                }
                            }
                        }
                    }
                }
            }
        }

        for (jid, affiliation) in affiliation_updates {
            let result = if affiliation == Affiliation::None {
                self.ctx.backend.delete_affiliation(&node_id, &jid).await
            } else {
                self.ctx
                    .backend
                    .save_affiliation(&node_id, &jid, affiliation)
                    .await
            };
            if let Err(e) = result {
                warn!(node = %node_id, jid = %jid, error = %e, "Affiliation record update failed");
            }
        }
        for sub_id in deleted_subscriptions {
            if let Err(e) = self.ctx.backend.delete_subscription(&node_id, &sub_id).await {
                warn!(node = %node_id, error = %e, "Subscription record delete failed");
            }
        }
        for subscription in saved_subscriptions {
            if let Err(e) = self
                .ctx
                .backend
                .save_subscription(&node_id, &subscription)
                .await
            {
                warn!(node = %node_id, error = %e, "Subscription record update failed");
            }
        }

        self.route_messages(messages);

        if failed.is_empty() {
            return Ok(result_iq(iq, None));
        }

        // Echo the failed entities with the state they still hold.
        let mut entities_elem =
            Element::builder("entities", NS_PUBSUB_OWNER).attr("node", node_id.as_str());
        for entity in &failed {
            entities_elem = entities_elem.append(
                Element::builder("entity", NS_PUBSUB_OWNER)
                    .attr("jid", entity.jid.to_string().as_str())
                    .attr("affiliation", entity.prior_affiliation.to_string().as_str())
                    .build(),
            );
        }
        let mut stanza_error = PubSubError::not_acceptable(None).to_stanza_error();
        stanza_error.other = Some(entities_elem.build());
        Ok(Iq {
            from: iq.to.clone(),
            to: iq.from.clone(),
            id: iq.id.clone(),
            payload: IqType::Error(stanza_error),
        })
    }

    /// Owner-or-admin check shared by the owner surface.
    pub(super) fn require_owner(&self, node: &Node, sender: &BareJid) -> Result<(), PubSubError> {
        if node.is_owner(sender) || self.is_admin(sender) {
            Ok(())
        } else {
            Err(PubSubError::forbidden())
        }
    }
}
