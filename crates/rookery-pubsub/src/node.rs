//! PubSub nodes: leaves holding items, collections holding children.
//!
//! A node owns its affiliations, subscriptions, and (for leaves) a
//! bounded item history. All mutation happens while the caller holds
//! the node's lock; the notification builders only produce messages,
//! sending is the caller's job once the lock is released.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::message::{Body, Message, MessageType};

use crate::affiliate::NodeAffiliate;
use crate::config::NodeConfig;
use crate::forms::{
    build_field_boolean, build_field_hidden, build_field_text_single, form_element,
    FORM_TYPE_SUBSCRIBE_AUTHORIZATION,
};
use crate::item::PublishedItem;
use crate::presence::PresenceTracker;
use crate::stanza::{NS_PUBSUB, NS_PUBSUB_EVENT};
use crate::subscription::{NodeSubscription, SubscriptionOptions};
use crate::types::{AccessModel, Affiliation, SubscriptionState};

/// Node identifier, unique within the service.
pub type NodeId = String;

/// Kind-specific node state.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Holds published items.
    Leaf {
        /// Item history, oldest first.
        items: Vec<PublishedItem>,
    },
    /// Holds child nodes.
    Collection {
        /// Child node ids, in association order.
        children: Vec<NodeId>,
    },
}

/// A topic node.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique id within the service.
    pub node_id: NodeId,
    /// Parent collection; None only for the root collection.
    pub parent: Option<NodeId>,
    /// Who created the node.
    pub creator: BareJid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Owner set; never empty.
    owners: HashSet<BareJid>,
    /// Node configuration.
    pub config: NodeConfig,
    /// Kind-specific state.
    pub kind: NodeKind,
    affiliations: HashMap<BareJid, Affiliation>,
    subscriptions: HashMap<String, NodeSubscription>,
}

impl Node {
    /// Create a leaf node with the creator as sole owner.
    pub fn new_leaf(
        node_id: NodeId,
        parent: Option<NodeId>,
        creator: BareJid,
        config: NodeConfig,
    ) -> Self {
        Self::new(
            node_id,
            parent,
            creator,
            config,
            NodeKind::Leaf { items: Vec::new() },
        )
    }

    /// Create a collection node with the creator as sole owner.
    pub fn new_collection(
        node_id: NodeId,
        parent: Option<NodeId>,
        creator: BareJid,
        config: NodeConfig,
    ) -> Self {
        Self::new(
            node_id,
            parent,
            creator,
            config,
            NodeKind::Collection {
                children: Vec::new(),
            },
        )
    }

    fn new(
        node_id: NodeId,
        parent: Option<NodeId>,
        creator: BareJid,
        config: NodeConfig,
        kind: NodeKind,
    ) -> Self {
        let mut node = Self {
            node_id,
            parent,
            creator: creator.clone(),
            created_at: Utc::now(),
            owners: HashSet::new(),
            config,
            kind,
            affiliations: HashMap::new(),
            subscriptions: HashMap::new(),
        };
        node.add_owner(creator);
        node
    }

    /// Whether this is a collection node.
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NodeKind::Collection { .. })
    }

    /// Whether this is a leaf node.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    // =========================================================================
    // Owners & affiliations
    // =========================================================================

    /// The owner set.
    pub fn owners(&self) -> impl Iterator<Item = &BareJid> {
        self.owners.iter()
    }

    /// Owner list as a vector (for form building).
    pub fn owner_list(&self) -> Vec<BareJid> {
        self.owners.iter().cloned().collect()
    }

    /// Whether the bare JID owns this node.
    pub fn is_owner(&self, jid: &BareJid) -> bool {
        self.owners.contains(jid)
    }

    /// Grant ownership.
    pub fn add_owner(&mut self, jid: BareJid) {
        self.owners.insert(jid.clone());
        self.affiliations.insert(jid, Affiliation::Owner);
    }

    /// Revoke ownership, demoting to the given affiliation.
    ///
    /// Rejected when the JID is the unique owner.
    pub fn remove_owner(&mut self, jid: &BareJid, demote_to: Affiliation) -> Result<(), ()> {
        if self.owners.contains(jid) && self.owners.len() == 1 {
            return Err(());
        }
        self.owners.remove(jid);
        if demote_to == Affiliation::None && !self.has_subscriptions_for(jid) {
            self.affiliations.remove(jid);
        } else {
            self.affiliations.insert(jid.clone(), demote_to);
        }
        Ok(())
    }

    /// Replace the owner set wholesale (configuration form).
    ///
    /// Rejected when the new set is empty.
    pub fn set_owners(&mut self, new_owners: Vec<BareJid>) -> Result<(), ()> {
        if new_owners.is_empty() {
            return Err(());
        }
        for old in std::mem::take(&mut self.owners) {
            if !new_owners.contains(&old) {
                self.affiliations.remove(&old);
            }
        }
        for owner in new_owners {
            self.add_owner(owner);
        }
        Ok(())
    }

    /// The entity's affiliation, defaulting to none.
    pub fn affiliation_of(&self, jid: &BareJid) -> Affiliation {
        self.affiliations
            .get(jid)
            .copied()
            .unwrap_or(Affiliation::None)
    }

    /// Set an affiliation directly.
    ///
    /// Owner transitions keep the owner set in sync; demoting the
    /// unique owner is rejected.
    pub fn set_affiliation(&mut self, jid: BareJid, affiliation: Affiliation) -> Result<(), ()> {
        if affiliation == Affiliation::Owner {
            self.add_owner(jid);
            return Ok(());
        }
        if self.owners.contains(&jid) {
            return self.remove_owner(&jid, affiliation);
        }
        if affiliation == Affiliation::None {
            self.affiliations.remove(&jid);
        } else {
            self.affiliations.insert(jid, affiliation);
        }
        Ok(())
    }

    /// All affiliates, sorted by JID for deterministic listings.
    pub fn affiliates(&self) -> Vec<NodeAffiliate> {
        let mut affiliates: Vec<NodeAffiliate> = self
            .affiliations
            .iter()
            .map(|(jid, affiliation)| NodeAffiliate::new(jid.clone(), *affiliation))
            .collect();
        affiliates.sort_by(|a, b| a.jid.to_string().cmp(&b.jid.to_string()));
        affiliates
    }

    /// Drop a bare member/none affiliation once its last subscription goes.
    fn cleanup_affiliation(&mut self, jid: &BareJid) {
        if self.has_subscriptions_for(jid) {
            return;
        }
        if let Some(affiliation) = self.affiliations.get(jid) {
            if NodeAffiliate::new(jid.clone(), *affiliation).is_disposable() {
                self.affiliations.remove(jid);
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Number of subscriptions on this node.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Iterate over all subscriptions.
    pub fn subscriptions(&self) -> impl Iterator<Item = &NodeSubscription> {
        self.subscriptions.values()
    }

    /// Look up a subscription by id.
    pub fn subscription_by_id(&self, sub_id: &str) -> Option<&NodeSubscription> {
        self.subscriptions.get(sub_id)
    }

    /// All subscriptions owned by the bare JID.
    pub fn subscriptions_for(&self, owner: &BareJid) -> Vec<&NodeSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.owner == *owner)
            .collect()
    }

    /// Whether the bare JID holds any subscription here.
    pub fn has_subscriptions_for(&self, owner: &BareJid) -> bool {
        self.subscriptions.values().any(|s| s.owner == *owner)
    }

    /// Create a subscription and, when the entity has no affiliation
    /// yet, a member affiliation to go with it.
    pub fn create_subscription(
        &mut self,
        owner: BareJid,
        jid: Jid,
        state: SubscriptionState,
        options: SubscriptionOptions,
    ) -> NodeSubscription {
        let sub_id = Uuid::new_v4().to_string();
        let mut subscription = NodeSubscription::new(sub_id.clone(), owner.clone(), jid, state);
        subscription.options = options;
        self.subscriptions.insert(sub_id.clone(), subscription.clone());
        self.affiliations
            .entry(owner)
            .or_insert(Affiliation::Member);
        debug!(node = %self.node_id, subid = %sub_id, state = %state, "Subscription created");
        subscription
    }

    /// Update a subscription in place.
    pub fn update_subscription<F: FnOnce(&mut NodeSubscription)>(
        &mut self,
        sub_id: &str,
        update: F,
    ) -> Option<NodeSubscription> {
        let subscription = self.subscriptions.get_mut(sub_id)?;
        update(subscription);
        Some(subscription.clone())
    }

    /// Remove a subscription, cleaning up a disposable affiliation.
    pub fn remove_subscription(&mut self, sub_id: &str) -> Option<NodeSubscription> {
        let removed = self.subscriptions.remove(sub_id)?;
        let owner = removed.owner.clone();
        self.cleanup_affiliation(&owner);
        Some(removed)
    }

    /// Remove every subscription owned by the bare JID.
    pub fn remove_subscriptions_for(&mut self, owner: &BareJid) -> Vec<NodeSubscription> {
        let ids: Vec<String> = self
            .subscriptions
            .values()
            .filter(|s| s.owner == *owner)
            .map(|s| s.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.remove_subscription(id))
            .collect()
    }

    /// Resolve a pending subscription.
    ///
    /// Approval activates it; denial removes it. Returns the
    /// subscription in its final state.
    pub fn approve_subscription(&mut self, sub_id: &str, approved: bool) -> Option<NodeSubscription> {
        if approved {
            self.update_subscription(sub_id, |s| s.state = SubscriptionState::Subscribed)
        } else {
            let mut removed = self.remove_subscription(sub_id)?;
            removed.state = SubscriptionState::None;
            Some(removed)
        }
    }

    // =========================================================================
    // Leaf items
    // =========================================================================

    /// The item history, oldest first. Empty for collections.
    pub fn items(&self) -> &[PublishedItem] {
        match &self.kind {
            NodeKind::Leaf { items } => items,
            NodeKind::Collection { .. } => &[],
        }
    }

    /// Look up an item by id.
    pub fn item_by_id(&self, item_id: &str) -> Option<&PublishedItem> {
        match &self.kind {
            NodeKind::Leaf { items } => items.iter().find(|i| i.id == item_id),
            NodeKind::Collection { .. } => None,
        }
    }

    /// The most recently published item.
    pub fn last_item(&self) -> Option<&PublishedItem> {
        match &self.kind {
            NodeKind::Leaf { items } => items.last(),
            NodeKind::Collection { .. } => None,
        }
    }

    /// Insert an item, replacing any same-id predecessor and enforcing
    /// the history bound. Returns the evicted items so their stored
    /// counterparts can be queued for removal.
    pub fn publish_item(&mut self, item: PublishedItem) -> Vec<PublishedItem> {
        let bound = if self.config.persist_items {
            self.config.max_items.max(1) as usize
        } else {
            // Non-persistent leaves only remember the newest item.
            1
        };
        let NodeKind::Leaf { items } = &mut self.kind else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        if let Some(pos) = items.iter().position(|i| i.id == item.id) {
            evicted.push(items.remove(pos));
        }
        items.push(item);

        while items.len() > bound {
            evicted.push(items.remove(0));
        }
        evicted
    }

    /// Remove an item by id.
    pub fn retract_item(&mut self, item_id: &str) -> Option<PublishedItem> {
        let NodeKind::Leaf { items } = &mut self.kind else {
            return None;
        };
        let pos = items.iter().position(|i| i.id == item_id)?;
        Some(items.remove(pos))
    }

    /// Clear the item history, returning what was removed.
    pub fn purge_items(&mut self) -> Vec<PublishedItem> {
        match &mut self.kind {
            NodeKind::Leaf { items } => items.drain(..).collect(),
            NodeKind::Collection { .. } => Vec::new(),
        }
    }

    // =========================================================================
    // Collection children
    // =========================================================================

    /// Child node ids. Empty for leaves.
    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Collection { children } => children,
            NodeKind::Leaf { .. } => &[],
        }
    }

    /// Associate a child node.
    pub fn add_child(&mut self, child: NodeId) {
        if let NodeKind::Collection { children } = &mut self.kind {
            if !children.contains(&child) {
                children.push(child);
            }
        }
    }

    /// Dissociate a child node.
    pub fn remove_child(&mut self, child: &str) {
        if let NodeKind::Collection { children } = &mut self.kind {
            children.retain(|c| c != child);
        }
    }

    // =========================================================================
    // Notification building
    // =========================================================================

    /// Whether delivery to this subscription is presence-gated.
    fn presence_gated(&self, subscription: &NodeSubscription) -> bool {
        self.config.access_model == AccessModel::Presence
            || self.config.presence_based_delivery
            || subscription.options.presence_based_delivery
    }

    /// Active subscriptions whose delivery policy currently admits events.
    ///
    /// Presence is always checked against the subscription owner's bare
    /// JID, never the full delivery address.
    fn admitted_subscriptions(&self, tracker: &PresenceTracker) -> Vec<&NodeSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.is_active() && s.options.deliver)
            .filter(|s| {
                if !self.presence_gated(s) {
                    return true;
                }
                let shows = tracker.shows_for(&Jid::from(s.owner.clone()));
                s.admits_show(&shows)
            })
            .collect()
    }

    fn event_message(&self, service: &BareJid, to: &Jid, event_child: Element) -> Message {
        let mut msg = Message::new(Some(to.clone()));
        msg.from = Some(Jid::from(service.clone()));
        msg.id = Some(Uuid::now_v7().to_string());
        msg.type_ = MessageType::Normal;
        msg.payloads.push(
            Element::builder("event", NS_PUBSUB_EVENT)
                .append(event_child)
                .build(),
        );
        msg
    }

    /// Event messages for a freshly published batch.
    ///
    /// Items are delivered in publication order. A digest subscriber
    /// gets one message carrying the whole admitted batch; everyone
    /// else gets one message per item.
    pub fn publish_event_messages(
        &self,
        service: &BareJid,
        items: &[PublishedItem],
        tracker: &PresenceTracker,
    ) -> Vec<Message> {
        let mut messages = Vec::new();
        for subscription in self.admitted_subscriptions(tracker) {
            let admitted: Vec<&PublishedItem> = items
                .iter()
                .filter(|item| subscription.admits_item(item))
                .collect();
            if admitted.is_empty() {
                continue;
            }

            let include_payload = self.config.deliver_payloads;
            if subscription.options.digest {
                let mut items_elem =
                    Element::builder("items", NS_PUBSUB_EVENT).attr("node", self.node_id.as_str());
                for item in &admitted {
                    items_elem = items_elem.append(item.to_element(NS_PUBSUB_EVENT, include_payload));
                }
                let mut msg = self.event_message(service, &subscription.jid, items_elem.build());
                if subscription.options.include_body {
                    let text = admitted
                        .iter()
                        .map(|i| i.payload_text())
                        .collect::<Vec<_>>()
                        .join("\n");
                    msg.bodies.insert(String::new(), Body(text));
                }
                messages.push(msg);
            } else {
                for item in &admitted {
                    let items_elem = Element::builder("items", NS_PUBSUB_EVENT)
                        .attr("node", self.node_id.as_str())
                        .append(item.to_element(NS_PUBSUB_EVENT, include_payload))
                        .build();
                    let mut msg = self.event_message(service, &subscription.jid, items_elem);
                    if subscription.options.include_body {
                        msg.bodies.insert(String::new(), Body(item.payload_text()));
                    }
                    messages.push(msg);
                }
            }
        }
        messages
    }

    /// Event carrying the newest item for one fresh subscription.
    ///
    /// Applies the node's send-last policy plus the subscription's own
    /// delivery, presence, and keyword filters.
    pub fn last_item_event_for(
        &self,
        service: &BareJid,
        sub_id: &str,
        tracker: &PresenceTracker,
    ) -> Option<Message> {
        if self.config.send_last_published_item != crate::types::SendLastPublishedItem::OnSub {
            return None;
        }
        let item = self.last_item()?;
        let subscription = self.subscription_by_id(sub_id)?;
        if !subscription.is_active() || !subscription.options.deliver {
            return None;
        }
        if self.presence_gated(subscription) {
            let shows = tracker.shows_for(&Jid::from(subscription.owner.clone()));
            if !subscription.admits_show(&shows) {
                return None;
            }
        }
        if !subscription.admits_item(item) {
            return None;
        }

        let items_elem = Element::builder("items", NS_PUBSUB_EVENT)
            .attr("node", self.node_id.as_str())
            .append(item.to_element(NS_PUBSUB_EVENT, self.config.deliver_payloads))
            .build();
        let mut msg = self.event_message(service, &subscription.jid, items_elem);
        if subscription.options.include_body {
            msg.bodies.insert(String::new(), Body(item.payload_text()));
        }
        Some(msg)
    }

    /// Event messages for retracted items, if the node notifies retractions.
    pub fn retract_event_messages(
        &self,
        service: &BareJid,
        item_ids: &[String],
        tracker: &PresenceTracker,
    ) -> Vec<Message> {
        if !self.config.notify_retract {
            return Vec::new();
        }
        let mut messages = Vec::new();
        for subscription in self.admitted_subscriptions(tracker) {
            let mut items_elem =
                Element::builder("items", NS_PUBSUB_EVENT).attr("node", self.node_id.as_str());
            for id in item_ids {
                items_elem = items_elem.append(
                    Element::builder("retract", NS_PUBSUB_EVENT)
                        .attr("id", id.as_str())
                        .build(),
                );
            }
            messages.push(self.event_message(service, &subscription.jid, items_elem.build()));
        }
        messages
    }

    /// Event messages announcing node deletion to every subscriber.
    ///
    /// Deletion doubles as subscription cancellation, so it goes to all
    /// subscriptions regardless of state or presence.
    pub fn delete_event_messages(&self, service: &BareJid) -> Vec<Message> {
        if !self.config.notify_delete {
            return Vec::new();
        }
        let delete_elem = || {
            Element::builder("delete", NS_PUBSUB_EVENT)
                .attr("node", self.node_id.as_str())
                .build()
        };
        self.subscriptions
            .values()
            .map(|s| self.event_message(service, &s.jid, delete_elem()))
            .collect()
    }

    /// Event messages announcing an item purge.
    pub fn purge_event_messages(
        &self,
        service: &BareJid,
        tracker: &PresenceTracker,
    ) -> Vec<Message> {
        let purge_elem = || {
            Element::builder("purge", NS_PUBSUB_EVENT)
                .attr("node", self.node_id.as_str())
                .build()
        };
        self.admitted_subscriptions(tracker)
            .into_iter()
            .map(|s| self.event_message(service, &s.jid, purge_elem()))
            .collect()
    }

    /// Event messages announcing a configuration change.
    pub fn config_event_messages(
        &self,
        service: &BareJid,
        tracker: &PresenceTracker,
    ) -> Vec<Message> {
        if !self.config.notify_config {
            return Vec::new();
        }
        let config_elem = || {
            Element::builder("configuration", NS_PUBSUB_EVENT)
                .attr("node", self.node_id.as_str())
                .build()
        };
        self.admitted_subscriptions(tracker)
            .into_iter()
            .map(|s| self.event_message(service, &s.jid, config_elem()))
            .collect()
    }

    /// Status message telling a subscriber their subscription changed state.
    pub fn subscription_state_message(
        &self,
        service: &BareJid,
        subscription: &NodeSubscription,
    ) -> Message {
        let mut msg = Message::new(Some(subscription.jid.clone()));
        msg.from = Some(Jid::from(service.clone()));
        msg.id = Some(Uuid::now_v7().to_string());
        msg.type_ = MessageType::Normal;
        msg.payloads.push(
            Element::builder("pubsub", NS_PUBSUB)
                .append(subscription.to_element(
                    NS_PUBSUB,
                    Some(self.node_id.as_str()),
                    self.config.multiple_subscriptions,
                ))
                .build(),
        );
        msg
    }

    /// Authorization request forms for every owner of the node.
    pub fn authorization_request_messages(
        &self,
        service: &BareJid,
        subscription: &NodeSubscription,
    ) -> Vec<Message> {
        let build_form = || {
            let mut form = form_element("form");
            form.append_child(build_field_hidden(
                "FORM_TYPE",
                FORM_TYPE_SUBSCRIBE_AUTHORIZATION,
            ));
            form.append_child(build_field_text_single(
                "pubsub#node",
                "Node",
                &self.node_id,
            ));
            form.append_child(build_field_text_single(
                "pubsub#subscriber_jid",
                "Subscriber address",
                &subscription.jid.to_string(),
            ));
            form.append_child(build_field_text_single(
                "pubsub#subid",
                "Subscription id",
                &subscription.id,
            ));
            form.append_child(build_field_boolean(
                "pubsub#allow",
                "Allow this subscription?",
                false,
            ));
            form
        };

        self.owners
            .iter()
            .map(|owner| {
                let mut msg = Message::new(Some(Jid::from(owner.clone())));
                msg.from = Some(Jid::from(service.clone()));
                msg.id = Some(Uuid::now_v7().to_string());
                msg.type_ = MessageType::Normal;
                msg.payloads.push(build_form());
                msg
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SendLastPublishedItem;

    fn bare(s: &str) -> BareJid {
        s.parse().expect("valid bare jid")
    }

    fn leaf() -> Node {
        Node::new_leaf(
            "/blog".to_string(),
            Some(String::new()),
            bare("alice@rookery.chat"),
            NodeConfig::leaf_default(),
        )
    }

    fn test_item(id: &str, text: &str) -> PublishedItem {
        PublishedItem::new(
            "/blog".to_string(),
            id.to_string(),
            "alice@rookery.chat/desk".parse().unwrap(),
            Some(
                format!("<entry xmlns='urn:test'>{}</entry>", text)
                    .parse()
                    .unwrap(),
            ),
        )
    }

    #[test]
    fn test_creator_becomes_owner() {
        let node = leaf();
        assert!(node.is_owner(&bare("alice@rookery.chat")));
        assert_eq!(
            node.affiliation_of(&bare("alice@rookery.chat")),
            Affiliation::Owner
        );
    }

    #[test]
    fn test_cannot_remove_unique_owner() {
        let mut node = leaf();
        assert!(node
            .remove_owner(&bare("alice@rookery.chat"), Affiliation::None)
            .is_err());

        node.add_owner(bare("bob@rookery.chat"));
        assert!(node
            .remove_owner(&bare("alice@rookery.chat"), Affiliation::None)
            .is_ok());
        assert!(node.is_owner(&bare("bob@rookery.chat")));
        assert!(!node.is_owner(&bare("alice@rookery.chat")));
    }

    #[test]
    fn test_set_owners_rejects_empty() {
        let mut node = leaf();
        assert!(node.set_owners(Vec::new()).is_err());
        assert!(node.set_owners(vec![bare("bob@rookery.chat")]).is_ok());
        assert!(node.is_owner(&bare("bob@rookery.chat")));
        assert!(!node.is_owner(&bare("alice@rookery.chat")));
    }

    #[test]
    fn test_publish_replaces_same_id() {
        let mut node = leaf();
        node.publish_item(test_item("i1", "one"));
        let evicted = node.publish_item(test_item("i1", "two"));

        assert_eq!(node.items().len(), 1);
        assert_eq!(evicted.len(), 1);
        assert_eq!(node.item_by_id("i1").unwrap().payload_text(), "two");
    }

    #[test]
    fn test_publish_enforces_history_bound() {
        let mut node = leaf();
        node.config.max_items = 2;
        node.publish_item(test_item("i1", "a"));
        node.publish_item(test_item("i2", "b"));
        let evicted = node.publish_item(test_item("i3", "c"));

        assert_eq!(node.items().len(), 2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "i1");
        assert!(node.item_by_id("i1").is_none());
    }

    #[test]
    fn test_non_persistent_leaf_keeps_last_item_only() {
        let mut node = leaf();
        node.config.persist_items = false;
        node.publish_item(test_item("i1", "a"));
        node.publish_item(test_item("i2", "b"));

        assert_eq!(node.items().len(), 1);
        assert_eq!(node.last_item().unwrap().id, "i2");
    }

    #[test]
    fn test_subscription_creates_member_affiliation() {
        let mut node = leaf();
        let sub = node.create_subscription(
            bare("bob@rookery.chat"),
            "bob@rookery.chat/r1".parse().unwrap(),
            SubscriptionState::Subscribed,
            SubscriptionOptions::default(),
        );
        assert_eq!(
            node.affiliation_of(&bare("bob@rookery.chat")),
            Affiliation::Member
        );

        node.remove_subscription(&sub.id);
        assert_eq!(
            node.affiliation_of(&bare("bob@rookery.chat")),
            Affiliation::None
        );
    }

    #[test]
    fn test_remove_subscription_keeps_strong_affiliation() {
        let mut node = leaf();
        node.set_affiliation(bare("bob@rookery.chat"), Affiliation::Publisher)
            .unwrap();
        let sub = node.create_subscription(
            bare("bob@rookery.chat"),
            Jid::from(bare("bob@rookery.chat")),
            SubscriptionState::Subscribed,
            SubscriptionOptions::default(),
        );

        node.remove_subscription(&sub.id);
        assert_eq!(
            node.affiliation_of(&bare("bob@rookery.chat")),
            Affiliation::Publisher
        );
    }

    #[test]
    fn test_approve_subscription() {
        let mut node = leaf();
        let sub = node.create_subscription(
            bare("carol@rookery.chat"),
            Jid::from(bare("carol@rookery.chat")),
            SubscriptionState::Pending,
            SubscriptionOptions::default(),
        );

        let approved = node.approve_subscription(&sub.id, true).unwrap();
        assert_eq!(approved.state, SubscriptionState::Subscribed);
        assert!(node.subscription_by_id(&sub.id).unwrap().is_active());
    }

    #[test]
    fn test_deny_subscription_removes_it() {
        let mut node = leaf();
        let sub = node.create_subscription(
            bare("carol@rookery.chat"),
            Jid::from(bare("carol@rookery.chat")),
            SubscriptionState::Pending,
            SubscriptionOptions::default(),
        );

        let denied = node.approve_subscription(&sub.id, false).unwrap();
        assert_eq!(denied.state, SubscriptionState::None);
        assert!(node.subscription_by_id(&sub.id).is_none());
    }

    #[test]
    fn test_publish_events_in_document_order() {
        let mut node = leaf();
        let tracker = PresenceTracker::new();
        node.create_subscription(
            bare("bob@rookery.chat"),
            "bob@rookery.chat/r1".parse().unwrap(),
            SubscriptionState::Subscribed,
            SubscriptionOptions::default(),
        );

        let batch = vec![
            test_item("a", "first"),
            test_item("b", "second"),
            test_item("c", "third"),
        ];
        let messages = node.publish_event_messages(&bare("pubsub.rookery.chat"), &batch, &tracker);

        assert_eq!(messages.len(), 3);
        for (msg, expected) in messages.iter().zip(["a", "b", "c"]) {
            let event = msg
                .payloads
                .iter()
                .find(|p| p.name() == "event")
                .expect("event payload");
            let items = event.children().next().expect("items child");
            let item = items.children().next().expect("item child");
            assert_eq!(item.attr("id"), Some(expected));
        }
    }

    #[test]
    fn test_digest_coalesces_batch() {
        let mut node = leaf();
        let tracker = PresenceTracker::new();
        let mut options = SubscriptionOptions::default();
        options.digest = true;
        node.create_subscription(
            bare("bob@rookery.chat"),
            Jid::from(bare("bob@rookery.chat")),
            SubscriptionState::Subscribed,
            options,
        );

        let batch = vec![test_item("a", "x"), test_item("b", "y")];
        let messages = node.publish_event_messages(&bare("pubsub.rookery.chat"), &batch, &tracker);

        assert_eq!(messages.len(), 1);
        let event = &messages[0].payloads[0];
        let items = event.children().next().unwrap();
        assert_eq!(items.children().count(), 2);
    }

    #[test]
    fn test_presence_gated_node_skips_absent_subscriber() {
        let mut node = leaf();
        node.config.presence_based_delivery = true;
        let tracker = PresenceTracker::new();
        node.create_subscription(
            bare("bob@rookery.chat"),
            "bob@rookery.chat/r1".parse().unwrap(),
            SubscriptionState::Subscribed,
            SubscriptionOptions::default(),
        );

        let batch = vec![test_item("a", "x")];
        assert!(node
            .publish_event_messages(&bare("pubsub.rookery.chat"), &batch, &tracker)
            .is_empty());

        // bare-JID presence admits delivery even for a full-JID address
        tracker.on_available("bob@rookery.chat/r2".parse().unwrap(), None);
        assert_eq!(
            node.publish_event_messages(&bare("pubsub.rookery.chat"), &batch, &tracker)
                .len(),
            1
        );
    }

    #[test]
    fn test_keyword_filter_drops_items() {
        let mut node = leaf();
        let tracker = PresenceTracker::new();
        let mut options = SubscriptionOptions::default();
        options.keyword = Some("rust".to_string());
        node.create_subscription(
            bare("bob@rookery.chat"),
            Jid::from(bare("bob@rookery.chat")),
            SubscriptionState::Subscribed,
            options,
        );

        let batch = vec![test_item("a", "rust news"), test_item("b", "other")];
        let messages = node.publish_event_messages(&bare("pubsub.rookery.chat"), &batch, &tracker);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_include_body_echoes_payload_text() {
        let mut node = leaf();
        let tracker = PresenceTracker::new();
        let mut options = SubscriptionOptions::default();
        options.include_body = true;
        node.create_subscription(
            bare("bob@rookery.chat"),
            Jid::from(bare("bob@rookery.chat")),
            SubscriptionState::Subscribed,
            options,
        );

        let batch = vec![test_item("a", "hello birds")];
        let messages = node.publish_event_messages(&bare("pubsub.rookery.chat"), &batch, &tracker);
        assert_eq!(messages[0].bodies.len(), 1);
    }

    #[test]
    fn test_delete_events_reach_pending_subscribers() {
        let mut node = leaf();
        node.create_subscription(
            bare("bob@rookery.chat"),
            Jid::from(bare("bob@rookery.chat")),
            SubscriptionState::Pending,
            SubscriptionOptions::default(),
        );

        let messages = node.delete_event_messages(&bare("pubsub.rookery.chat"));
        assert_eq!(messages.len(), 1);

        node.config.notify_delete = false;
        assert!(node.delete_event_messages(&bare("pubsub.rookery.chat")).is_empty());
    }

    #[test]
    fn test_authorization_requests_go_to_each_owner() {
        let mut node = leaf();
        node.add_owner(bare("owner2@rookery.chat"));
        node.config.access_model = AccessModel::Authorize;
        let sub = node.create_subscription(
            bare("carol@rookery.chat"),
            Jid::from(bare("carol@rookery.chat")),
            SubscriptionState::Pending,
            SubscriptionOptions::default(),
        );

        let messages = node.authorization_request_messages(&bare("pubsub.rookery.chat"), &sub);
        assert_eq!(messages.len(), 2);
        let form = &messages[0].payloads[0];
        assert_eq!(form.name(), "x");
    }

    #[test]
    fn test_last_item_event_respects_send_last_policy() {
        let mut node = leaf();
        let tracker = PresenceTracker::new();
        node.publish_item(test_item("i1", "latest"));
        let sub = node.create_subscription(
            bare("bob@rookery.chat"),
            Jid::from(bare("bob@rookery.chat")),
            SubscriptionState::Subscribed,
            SubscriptionOptions::default(),
        );

        let event = node.last_item_event_for(&bare("pubsub.rookery.chat"), &sub.id, &tracker);
        assert!(event.is_some());

        node.config.send_last_published_item = SendLastPublishedItem::Never;
        let event = node.last_item_event_for(&bare("pubsub.rookery.chat"), &sub.id, &tracker);
        assert!(event.is_none());
    }
}
