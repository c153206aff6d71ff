//! Item operations: publish, retract, retrieval, purge.

use minidom::Element;
use tracing::{debug, info};
use uuid::Uuid;
use xmpp_parsers::iq::Iq;

use crate::config::notify_attr;
use crate::error::{PubSubCondition, PubSubError};
use crate::item::PublishedItem;
use crate::stanza::{pubsub_envelope, result_iq, NS_PUBSUB};
use crate::types::SubscriptionState;

use super::PubSubService;

impl PubSubService {
    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish a batch of items to a leaf node.
    pub(super) async fn handle_publish(
        &self,
        iq: &Iq,
        publish: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = Self::required_node_attr(publish)?;
        let handle = self.node_or_not_found(&node_id)?;

        let item_elems: Vec<&Element> =
            publish.children().filter(|c| c.name() == "item").collect();

        let (published, evicted, messages, persist) = {
            let mut node = handle.write().await;
            if node.is_collection() {
                return Err(PubSubError::unsupported("publish"));
            }

            let is_admin = self.is_admin(&sender_bare);
            let affiliation = node.affiliation_of(&sender_bare);
            let is_subscriber = node
                .subscriptions_for(&sender_bare)
                .iter()
                .any(|s| s.is_active());
            if !node
                .config
                .publisher_model
                .can_publish(affiliation, is_subscriber)
                && !is_admin
            {
                return Err(PubSubError::forbidden());
            }

            let item_required = node.config.item_required();
            if item_required && item_elems.is_empty() {
                return Err(PubSubError::bad_request(Some(PubSubCondition::ItemRequired)));
            }
            if !item_required && !item_elems.is_empty() {
                return Err(PubSubError::bad_request(Some(
                    PubSubCondition::ItemForbidden,
                )));
            }

            let mut batch = Vec::with_capacity(item_elems.len());
            for item_elem in &item_elems {
                let payload_count = item_elem.children().count();
                if payload_count > 1 {
                    return Err(PubSubError::bad_request(Some(
                        PubSubCondition::InvalidPayload,
                    )));
                }
                if payload_count == 0 && node.config.deliver_payloads {
                    return Err(PubSubError::bad_request(Some(
                        PubSubCondition::PayloadRequired,
                    )));
                }

                let id = item_elem
                    .attr("id")
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let payload = item_elem.children().next().cloned();
                batch.push(PublishedItem::new(
                    node_id.clone(),
                    id,
                    sender.clone(),
                    payload,
                ));
            }

            let mut evicted = Vec::new();
            for item in &batch {
                evicted.extend(node.publish_item(item.clone()));
            }

            let messages = node.publish_event_messages(
                &self.ctx.config.service_jid,
                &batch,
                &self.presence,
            );
            (batch, evicted, messages, node.config.persist_items)
        };

        if persist {
            // A same-id replacement is covered by the idempotent add;
            // only items truly falling out of the history need removal.
            for old in evicted {
                if !published.iter().any(|i| i.id == old.id) {
                    self.batcher.queue_item_to_remove(old);
                }
            }
            for item in &published {
                self.batcher.queue_item_to_add(item.clone());
            }
        }

        info!(node = %node_id, publisher = %sender_bare, items = published.len(), "Items published");
        self.route_messages(messages);

        let mut publish_elem =
            Element::builder("publish", NS_PUBSUB).attr("node", node_id.as_str());
        for item in &published {
            publish_elem = publish_elem.append(
                Element::builder("item", NS_PUBSUB)
                    .attr("id", item.id.as_str())
                    .build(),
            );
        }
        Ok(result_iq(iq, Some(pubsub_envelope(publish_elem.build()))))
    }

    // =========================================================================
    // Retract
    // =========================================================================

    /// Retract named items from a persistent leaf.
    ///
    /// All-or-nothing: every named item must exist and be deletable by
    /// the sender before anything is removed.
    pub(super) async fn handle_retract(
        &self,
        iq: &Iq,
        retract: &Element,
    ) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = Self::required_node_attr(retract)?;
        let handle = self.node_or_not_found(&node_id)?;

        let mut item_ids = Vec::new();
        for item_elem in retract.children().filter(|c| c.name() == "item") {
            let id = item_elem
                .attr("id")
                .ok_or_else(|| PubSubError::bad_request(Some(PubSubCondition::ItemRequired)))?;
            item_ids.push(id.to_string());
        }
        if item_ids.is_empty() {
            return Err(PubSubError::bad_request(Some(PubSubCondition::ItemRequired)));
        }

        let (removed, messages) = {
            let mut node = handle.write().await;
            if !node.is_leaf() || !node.config.persist_items {
                return Err(PubSubError::unsupported("persistent-items"));
            }

            let is_admin = self.is_admin(&sender_bare);
            let is_owner = node.is_owner(&sender_bare);
            for id in &item_ids {
                let item = node.item_by_id(id).ok_or_else(PubSubError::item_not_found)?;
                if !item.can_delete(&sender_bare, is_owner, is_admin) {
                    return Err(PubSubError::forbidden());
                }
            }

            let removed: Vec<PublishedItem> = item_ids
                .iter()
                .filter_map(|id| node.retract_item(id))
                .collect();

            let notify = node.config.notify_retract || notify_attr(retract);
            let messages = if notify {
                node.retract_event_messages(&self.ctx.config.service_jid, &item_ids, &self.presence)
            } else {
                Vec::new()
            };
            (removed, messages)
        };

        for item in removed {
            self.batcher.queue_item_to_remove(item);
        }

        info!(node = %node_id, items = item_ids.len(), "Items retracted");
        self.route_messages(messages);
        Ok(result_iq(iq, None))
    }

    // =========================================================================
    // Retrieve items
    // =========================================================================

    /// Retrieve items from a leaf, honoring the node's access model
    /// and the requester's subscription filters.
    pub(super) async fn handle_items(&self, iq: &Iq, items: &Element) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = Self::required_node_attr(items)?;
        let handle = self.node_or_not_found(&node_id)?;
        let node = handle.read().await;

        if node.is_collection() {
            return Err(PubSubError::unsupported("retrieve-items"));
        }

        let privileged = node.is_owner(&sender_bare) || self.is_admin(&sender_bare);
        let mut keyword: Option<String> = None;
        if !privileged {
            self.check_access(&node, &sender_bare)?;

            // Locate the requester's subscription; with multiple
            // subscriptions enabled the subid attribute is mandatory
            // and the named subscription must be active.
            if node.config.multiple_subscriptions {
                let subid = items.attr("subid").ok_or_else(|| {
                    PubSubError::bad_request(Some(PubSubCondition::SubIdRequired))
                })?;
                let subscription = node.subscription_by_id(subid).ok_or_else(|| {
                    PubSubError::not_acceptable(Some(PubSubCondition::InvalidSubId))
                })?;
                match subscription.state {
                    SubscriptionState::Subscribed => {}
                    SubscriptionState::Pending => {
                        return Err(PubSubError::not_authorized(Some(
                            PubSubCondition::PendingSubscription,
                        )))
                    }
                    _ => {
                        return Err(PubSubError::not_authorized(Some(
                            PubSubCondition::NotSubscribed,
                        )))
                    }
                }
                keyword = subscription.options.keyword.clone();
            } else if let Some(subscription) =
                node.subscriptions_for(&sender_bare).first()
            {
                keyword = subscription.options.keyword.clone();
            }
        }

        let requested_ids: Vec<String> = items
            .children()
            .filter(|c| c.name() == "item")
            .filter_map(|c| c.attr("id").map(str::to_string))
            .collect();
        let max_items: Option<usize> = items.attr("max_items").and_then(|v| v.parse().ok());

        // Three retrieval modes: newest N, explicit ids (payload
        // forced), or the full history.
        let mut selected: Vec<(&PublishedItem, bool)> = if !requested_ids.is_empty() {
            requested_ids
                .iter()
                .filter_map(|id| node.item_by_id(id))
                .map(|item| (item, true))
                .collect()
        } else {
            let all = node.items();
            let skip = match max_items {
                Some(max) => all.len().saturating_sub(max),
                None => 0,
            };
            all.iter()
                .skip(skip)
                .map(|item| (item, node.config.deliver_payloads))
                .collect()
        };

        if let Some(keyword) = keyword {
            selected.retain(|(item, _)| item.matches_keyword(&keyword));
        }

        let mut items_elem = Element::builder("items", NS_PUBSUB).attr("node", node_id.as_str());
        for (item, include_payload) in selected {
            items_elem = items_elem.append(item.to_element(NS_PUBSUB, include_payload));
        }
        debug!(node = %node_id, "Items retrieved");
        Ok(result_iq(iq, Some(pubsub_envelope(items_elem.build()))))
    }

    // =========================================================================
    // Purge
    // =========================================================================

    /// Clear the item history of a persistent leaf.
    ///
    /// Purging an already-empty node succeeds.
    pub(super) async fn handle_purge(&self, iq: &Iq, purge: &Element) -> Result<Iq, PubSubError> {
        let sender = Self::sender_of(iq)?;
        let sender_bare = sender.to_bare();
        let node_id = Self::required_node_attr(purge)?;
        let handle = self.node_or_not_found(&node_id)?;

        let (cleared, messages) = {
            let mut node = handle.write().await;
            if node.is_collection() {
                return Err(PubSubError::unsupported("purge-nodes"));
            }
            if !node.config.persist_items {
                return Err(PubSubError::unsupported("persistent-items"));
            }
            self.require_owner(&node, &sender_bare)?;

            let cleared = node.purge_items();
            let messages =
                node.purge_event_messages(&self.ctx.config.service_jid, &self.presence);
            (cleared, messages)
        };

        // Pending adds cancel out; stored items get queued removals so
        // storage converges with the emptied history.
        for item in cleared {
            self.batcher.queue_item_to_remove(item);
        }

        info!(node = %node_id, "Node purged");
        self.route_messages(messages);
        Ok(result_iq(iq, None))
    }
}
