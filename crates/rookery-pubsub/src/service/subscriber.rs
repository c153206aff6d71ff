//! Subscriber operations: subscription lifecycle, options, per-user
//! listings, and owner authorization answers.

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::Iq;

use crate::error::{PubSubCondition, PubSubError};
use crate::forms::SubmittedForm;
use crate::node::Node;
use crate::stanza::{pubsub_envelope, result_iq, NS_PUBSUB};
use crate::subscription::SubscriptionOptions;
use crate::types::{AccessModel, Affiliation, SubscriptionState, SubscriptionType};

use super::PubSubService;

impl PubSubService {
    /// Resolve the node attribute of a subscriber action, falling back
    /// to the root collection when the service has one.
    fn subscriber_node_attr(&self, action: &Element) -> Result<String, PubSubError> {
        match action.attr("node") {
            Some(node) => Ok(node.to_string()),
            None => self
                .store
                .root_id()
                .map(str::to_string)
                .ok_or_else(|| PubSubError::bad_request(Some(PubSubCondition::NodeIdRequired))),
        }
    }

    /// Admission check shared by subscribe and item retrieval.
    ///
    /// Owners and admins are always admitted. Returns whether a new
    /// subscription must start pending. The roster model has no roster
    /// source inside the engine, so it admits nobody else.
    pub(super) fn check_access(
        &self,
        node: &Node,
        subscriber: &BareJid,
    ) -> Result<bool, PubSubError> {
        if node.is_owner(subscriber) || self.is_admin(subscriber) {
            return Ok(false);
        }
        if node.affiliation_of(subscriber) == Affiliation::Outcast {
            return Err(PubSubError::forbidden());
        }
        match node.config.access_model {
            AccessModel::Open => Ok(false),
            AccessModel::Presence => {
                if self.presence.is_available(subscriber) {
                    Ok(false)
                } else {
                    Err(PubSubError::not_authorized(Some(
                        PubSubCondition::PresenceSubscriptionRequired,
                    )))
                }
            }
            AccessModel::Roster => Err(PubSubError::not_authorized(Some(
                PubSubCondition::NotInRosterGroup,
            ))),
            AccessModel::Whitelist => {
                if node.affiliation_of(subscriber) >= Affiliation::Member {
                    Ok(false)
                } else {
                    Err(PubSubError::not_allowed(Some(PubSubCondition::ClosedNode)))
                }
            }
            AccessModel::Authorize => Ok(true),
        }
    }

    /// Node attribute for subscription elements: the root collection's
    /// id is omitted.
    fn reply_node_attr<'a>(&self, node_id: &'a str) -> Option<&'a str> {
        (!self.store.is_root(node_id)).then_some(node_id)
    }

    // =========================================================================
    // Subscribe / unsubscribe
    // =========================================================================

    /// Subscribe an entity to a node.
    pub(super) async fn handle_subscribe(
        &self,
        iq: &Iq,
        pubsub: &Element,
        subscribe: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = self.subscriber_node_attr(subscribe)?;
        let handle = self.node_or_not_found(&node_id)?;

        let jid_attr = subscribe
            .attr("jid")
            .ok_or_else(|| PubSubError::bad_request(Some(PubSubCondition::JidRequired)))?;
        let subscriber: Jid = jid_attr
            .parse()
            .map_err(|_| PubSubError::bad_request(Some(PubSubCondition::InvalidJid)))?;
        let subscriber_bare = subscriber.to_bare();

        let is_admin = self.is_admin(&sender_bare);
        if subscriber_bare != sender_bare && !is_admin {
            return Err(PubSubError::bad_request(Some(PubSubCondition::InvalidJid)));
        }
        if !self.ctx.users.is_registered(&subscriber_bare) && !is_admin {
            return Err(PubSubError::forbidden());
        }

        let mut options = SubscriptionOptions::default();
        if let Some(options_elem) = pubsub.get_child("options", NS_PUBSUB) {
            if let Some(form) = SubmittedForm::find_in(options_elem) {
                options.apply_form(&form);
            }
        }

        let (subscription, messages) = {
            let mut node = handle.write().await;

            if !node.config.subscription_enabled && !is_admin {
                return Err(PubSubError::not_allowed(None));
            }
            let pending = self.check_access(&node, &subscriber_bare)?;

            let existing = node.subscriptions_for(&subscriber_bare);
            if node.is_collection() {
                if let Some(same_type) = existing
                    .iter()
                    .find(|s| s.options.subscription_type == options.subscription_type)
                {
                    if options.subscription_type == SubscriptionType::Items
                        && !node.config.multiple_subscriptions
                    {
                        let echo = (*same_type).clone();
                        return Ok(self.subscription_reply(iq, &node, &echo));
                    }
                    return Err(PubSubError::conflict(None));
                }
            } else if !node.config.multiple_subscriptions {
                if let Some(existing) = existing.first() {
                    let echo = (*existing).clone();
                    return Ok(self.subscription_reply(iq, &node, &echo));
                }
            }

            let state = if pending {
                SubscriptionState::Pending
            } else {
                SubscriptionState::Subscribed
            };
            let subscription = node.create_subscription(
                subscriber_bare.clone(),
                subscriber.clone(),
                state,
                options,
            );

            let mut messages = Vec::new();
            if pending {
                messages.extend(
                    node.authorization_request_messages(&self.ctx.config.service_jid, &subscription),
                );
            } else {
                messages.extend(node.last_item_event_for(
                    &self.ctx.config.service_jid,
                    &subscription.id,
                    &self.presence,
                ));
            }
            (subscription, messages)
        };

        if let Err(e) = self
            .ctx
            .backend
            .save_subscription(&node_id, &subscription)
            .await
        {
            warn!(node = %node_id, error = %e, "Subscription record save failed");
        }
        let affiliation = handle.read().await.affiliation_of(&subscriber_bare);
        if let Err(e) = self
            .ctx
            .backend
            .save_affiliation(&node_id, &subscriber_bare, affiliation)
            .await
        {
            warn!(node = %node_id, error = %e, "Affiliation record save failed");
        }

        info!(node = %node_id, subscriber = %subscriber_bare, state = %subscription.state, "Subscription request handled");
        self.route_messages(messages);

        let node = handle.read().await;
        Ok(self.subscription_reply(iq, &node, &subscription))
    }

    /// Build the result IQ echoing a subscription's state.
    fn subscription_reply(
        &self,
        iq: &Iq,
        node: &Node,
        subscription: &crate::subscription::NodeSubscription,
    ) -> Iq {
        let elem = subscription.to_element(
            NS_PUBSUB,
            self.reply_node_attr(&node.node_id),
            node.config.multiple_subscriptions,
        );
        result_iq(iq, Some(pubsub_envelope(elem)))
    }

    /// Locate the subscription an unsubscribe/options request names.
    fn locate_subscription(
        node: &Node,
        action: &Element,
    ) -> Result<crate::subscription::NodeSubscription, PubSubError> {
        if node.config.multiple_subscriptions {
            let subid = action
                .attr("subid")
                .ok_or_else(|| PubSubError::bad_request(Some(PubSubCondition::SubIdRequired)))?;
            node.subscription_by_id(subid)
                .cloned()
                .ok_or_else(|| PubSubError::not_acceptable(Some(PubSubCondition::InvalidSubId)))
        } else {
            let jid_attr = action
                .attr("jid")
                .ok_or_else(|| PubSubError::bad_request(Some(PubSubCondition::JidRequired)))?;
            let target: Jid = jid_attr
                .parse()
                .map_err(|_| PubSubError::bad_request(Some(PubSubCondition::InvalidJid)))?;
            node.subscriptions_for(&target.to_bare())
                .first()
                .map(|s| (*s).clone())
                .ok_or_else(|| {
                    PubSubError::unexpected_request(Some(PubSubCondition::NotSubscribed))
                })
        }
    }

    /// Cancel a subscription.
    pub(super) async fn handle_unsubscribe(
        &self,
        iq: &Iq,
        unsubscribe: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = self.subscriber_node_attr(unsubscribe)?;
        let handle = self.node_or_not_found(&node_id)?;

        let (removed, remaining_affiliation) = {
            let mut node = handle.write().await;
            let subscription = Self::locate_subscription(&node, unsubscribe)?;
            if subscription.owner != sender_bare && !self.is_admin(&sender_bare) {
                return Err(PubSubError::forbidden());
            }
            let removed = node
                .remove_subscription(&subscription.id)
                .ok_or_else(|| {
                    PubSubError::unexpected_request(Some(PubSubCondition::NotSubscribed))
                })?;
            let remaining = node.affiliation_of(&removed.owner);
            (removed, remaining)
        };

        if let Err(e) = self
            .ctx
            .backend
            .delete_subscription(&node_id, &removed.id)
            .await
        {
            warn!(node = %node_id, error = %e, "Subscription record delete failed");
        }
        if remaining_affiliation == Affiliation::None {
            if let Err(e) = self
                .ctx
                .backend
                .delete_affiliation(&node_id, &removed.owner)
                .await
            {
                warn!(node = %node_id, error = %e, "Affiliation record delete failed");
            }
        }

        info!(node = %node_id, subscriber = %removed.owner, "Unsubscribed");
        Ok(result_iq(iq, None))
    }

    // =========================================================================
    // Subscription options
    // =========================================================================

    /// Return a subscription's configuration form.
    pub(super) async fn handle_options_get(
        &self,
        iq: &Iq,
        options: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = self.subscriber_node_attr(options)?;
        let handle = self.node_or_not_found(&node_id)?;
        let node = handle.read().await;

        let subscription = Self::locate_subscription(&node, options)?;
        if subscription.owner != sender_bare && !self.is_admin(&sender_bare) {
            return Err(PubSubError::forbidden());
        }

        let mut options_elem = Element::builder("options", NS_PUBSUB)
            .attr("jid", subscription.jid.to_string().as_str());
        if let Some(node_attr) = self.reply_node_attr(&node_id) {
            options_elem = options_elem.attr("node", node_attr);
        }
        if node.config.multiple_subscriptions {
            options_elem = options_elem.attr("subid", subscription.id.as_str());
        }
        let payload = pubsub_envelope(
            options_elem.append(subscription.options.to_form()).build(),
        );
        Ok(result_iq(iq, Some(payload)))
    }

    /// Apply a submitted subscription options form.
    pub(super) async fn handle_options_set(
        &self,
        iq: &Iq,
        options: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = self.subscriber_node_attr(options)?;
        let handle = self.node_or_not_found(&node_id)?;

        let form = SubmittedForm::find_in(options)
            .ok_or_else(|| PubSubError::bad_request(None))?;

        let updated = {
            let mut node = handle.write().await;
            let subscription = Self::locate_subscription(&node, options)?;
            if subscription.owner != sender_bare && !self.is_admin(&sender_bare) {
                return Err(PubSubError::forbidden());
            }
            node.update_subscription(&subscription.id, |s| s.options.apply_form(&form))
                .ok_or_else(|| {
                    PubSubError::unexpected_request(Some(PubSubCondition::NotSubscribed))
                })?
        };

        if let Err(e) = self
            .ctx
            .backend
            .save_subscription(&node_id, &updated)
            .await
        {
            warn!(node = %node_id, error = %e, "Subscription record save failed");
        }
        Ok(result_iq(iq, None))
    }

    // =========================================================================
    // Per-user listings
    // =========================================================================

    /// Aggregate the sender's subscriptions across every node.
    pub(super) async fn handle_list_subscriptions(&self, iq: &Iq) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();

        let mut subscriptions_elem = Element::builder("subscriptions", NS_PUBSUB);
        let mut found = false;
        for handle in self.store.all() {
            let node = handle.read().await;
            let affiliation = node.affiliation_of(&sender_bare);
            for subscription in node.subscriptions_for(&sender_bare) {
                found = true;
                let mut entry = Element::builder("subscription", NS_PUBSUB)
                    .attr("jid", subscription.jid.to_string().as_str())
                    .attr("affiliation", affiliation.to_string().as_str())
                    .attr("subscription", subscription.state.to_string().as_str());
                if let Some(node_attr) = self.reply_node_attr(&node.node_id) {
                    entry = entry.attr("node", node_attr);
                }
                if node.config.multiple_subscriptions {
                    entry = entry.attr("subid", subscription.id.as_str());
                }
                subscriptions_elem = subscriptions_elem.append(entry.build());
            }
        }

        if !found {
            return Err(PubSubError::item_not_found());
        }
        Ok(result_iq(iq, Some(pubsub_envelope(subscriptions_elem.build()))))
    }

    /// Aggregate the sender's affiliations across every node.
    pub(super) async fn handle_list_affiliations(&self, iq: &Iq) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();

        let mut affiliations_elem = Element::builder("affiliations", NS_PUBSUB);
        let mut found = false;
        for handle in self.store.all() {
            let node = handle.read().await;
            let affiliation = node.affiliation_of(&sender_bare);
            if affiliation == Affiliation::None {
                continue;
            }
            found = true;
            let mut entry = Element::builder("affiliation", NS_PUBSUB)
                .attr("affiliation", affiliation.to_string().as_str());
            if let Some(node_attr) = self.reply_node_attr(&node.node_id) {
                entry = entry.attr("node", node_attr);
            }
            affiliations_elem = affiliations_elem.append(entry.build());
        }

        if !found {
            return Err(PubSubError::item_not_found());
        }
        Ok(result_iq(iq, Some(pubsub_envelope(affiliations_elem.build()))))
    }

    // =========================================================================
    // Authorization answers
    // =========================================================================

    /// Resolve a pending subscription from an owner's submitted
    /// authorization form.
    ///
    /// The form locates the subscription by node and subid; unknown
    /// allow values are logged and ignored. The submitting JID is not
    /// checked against the owner set.
    pub(super) async fn handle_authorization_answer(&self, form: &SubmittedForm) {
        let Some(node_id) = form.value("pubsub#node") else {
            debug!("Authorization answer without a node field");
            return;
        };
        let Some(sub_id) = form.value("pubsub#subid") else {
            debug!("Authorization answer without a subid field");
            return;
        };
        let approved = match form.value("pubsub#allow") {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            other => {
                warn!(value = ?other, "Unrecognized allow value in authorization answer");
                return;
            }
        };

        let Some(handle) = self.store.get(node_id) else {
            debug!(node = %node_id, "Authorization answer for unknown node");
            return;
        };

        let (resolved, messages) = {
            let mut node = handle.write().await;
            let pending = node
                .subscription_by_id(sub_id)
                .filter(|s| s.state == SubscriptionState::Pending)
                .is_some();
            if !pending {
                debug!(node = %node_id, subid = %sub_id, "No pending subscription to resolve");
                return;
            }

            let Some(resolved) = node.approve_subscription(sub_id, approved) else {
                return;
            };
            let mut messages =
                vec![node.subscription_state_message(&self.ctx.config.service_jid, &resolved)];
            if approved {
                messages.extend(node.last_item_event_for(
                    &self.ctx.config.service_jid,
                    sub_id,
                    &self.presence,
                ));
            }
            (resolved, messages)
        };

        let record_result = if approved {
            self.ctx.backend.save_subscription(node_id, &resolved).await
        } else {
            self.ctx.backend.delete_subscription(node_id, sub_id).await
        };
        if let Err(e) = record_result {
            warn!(node = %node_id, error = %e, "Subscription record update failed");
        }

        info!(node = %node_id, subid = %sub_id, approved, "Pending subscription resolved");
        self.route_messages(messages);
    }
}
