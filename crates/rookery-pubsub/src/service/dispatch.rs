//! IQ dispatch: namespace and action routing.
//!
//! The first child element's namespace picks a family, the first
//! recognized child of that element picks the action. Unknown actions
//! inside a recognized family are answered with bad-request; an
//! unrecognized family is left for other modules of the outer server.

use minidom::Element;
use tracing::{debug, instrument};
use xmpp_parsers::iq::{Iq, IqType};

use crate::error::PubSubError;
use crate::stanza::{Stanza, NS_COMMANDS, NS_PUBSUB, NS_PUBSUB_OWNER};

use super::PubSubService;

impl PubSubService {
    /// Process an IQ addressed to the service.
    ///
    /// Returns true when the IQ was consumed (including error replies),
    /// false when it belongs to some other module.
    #[instrument(skip(self, iq), fields(iq_id = %iq.id, from = ?iq.from))]
    pub async fn process_iq(&self, iq: &Iq) -> bool {
        let (child, is_set) = match &iq.payload {
            // Replies to stanzas we sent; nothing to do.
            IqType::Result(_) | IqType::Error(_) => return true,
            IqType::Get(elem) => (elem, false),
            IqType::Set(elem) => (elem, true),
        };

        match (child.name(), child.ns().as_str()) {
            ("pubsub", NS_PUBSUB) => {
                let reply = match self.dispatch_pubsub(iq, child, is_set).await {
                    Ok(reply) => reply,
                    Err(error) => error.error_iq(iq),
                };
                self.route_iq(reply);
                true
            }
            ("pubsub", NS_PUBSUB_OWNER) => {
                let reply = match self.dispatch_owner(iq, child, is_set).await {
                    Ok(reply) => reply,
                    Err(error) => error.error_iq(iq),
                };
                self.route_iq(reply);
                true
            }
            ("command", NS_COMMANDS) => self.dispatch_command(iq).await,
            _ => {
                debug!(ns = %child.ns(), "IQ namespace not handled by the engine");
                false
            }
        }
    }

    /// Route an action in the main pubsub namespace.
    async fn dispatch_pubsub(
        &self,
        iq: &Iq,
        pubsub: &Element,
        is_set: bool,
    ) -> Result<Iq, PubSubError> {
        for action in pubsub.children() {
            match action.name() {
                "publish" => return self.handle_publish(iq, action).await,
                "subscribe" => return self.handle_subscribe(iq, pubsub, action).await,
                "unsubscribe" => return self.handle_unsubscribe(iq, action).await,
                "options" => {
                    return if is_set {
                        self.handle_options_set(iq, action).await
                    } else {
                        self.handle_options_get(iq, action).await
                    };
                }
                "create" => return self.handle_create(iq, pubsub, action).await,
                "subscriptions" => return self.handle_list_subscriptions(iq).await,
                "affiliations" => return self.handle_list_affiliations(iq).await,
                "items" => return self.handle_items(iq, action).await,
                "retract" => return self.handle_retract(iq, action).await,
                _ => continue,
            }
        }
        debug!("No recognized pubsub action");
        Err(PubSubError::bad_request(None))
    }

    /// Route an action in the pubsub#owner namespace.
    async fn dispatch_owner(
        &self,
        iq: &Iq,
        pubsub: &Element,
        is_set: bool,
    ) -> Result<Iq, PubSubError> {
        for action in pubsub.children() {
            match action.name() {
                "configure" => {
                    return if is_set {
                        self.handle_configure_set(iq, action).await
                    } else {
                        self.handle_configure_get(iq, action).await
                    };
                }
                "default" => return self.handle_default(iq, action).await,
                "delete" => return self.handle_delete(iq, action).await,
                "entities" => {
                    return if is_set {
                        self.handle_entities_modify(iq, action).await
                    } else {
                        self.handle_entities_get(iq, action).await
                    };
                }
                "purge" => return self.handle_purge(iq, action).await,
                _ => continue,
            }
        }
        debug!("No recognized pubsub#owner action");
        Err(PubSubError::bad_request(None))
    }

    /// Forward a command stanza to the external ad-hoc manager.
    async fn dispatch_command(&self, iq: &Iq) -> bool {
        let Some(commands) = &self.ctx.commands else {
            debug!("No ad-hoc command manager wired");
            return false;
        };
        if let Some(reply) = commands.process_command(iq).await {
            self.ctx.router.route(Stanza::Iq(reply));
        }
        true
    }
}
