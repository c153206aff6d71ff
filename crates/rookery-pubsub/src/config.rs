//! Node configuration.
//!
//! One configuration record covers both node kinds; the collection
//! policy fields are ignored on leaves. The service keeps a default
//! record per kind which seeds every newly created node.

use jid::BareJid;
use minidom::Element;

use crate::forms::{
    build_field_boolean, build_field_hidden, build_field_list_single, build_field_multi,
    build_field_text_single, form_element, parse_boolean, SubmittedForm, FORM_TYPE_NODE_CONFIG,
};
use crate::types::{
    AccessModel, AssociationPolicy, PublisherModel, SendLastPublishedItem,
};

/// Configuration for a PubSub node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Short human-readable name (pubsub#title).
    pub title: String,
    /// Longer description (pubsub#description).
    pub description: Option<String>,
    /// Who can subscribe and retrieve items.
    pub access_model: AccessModel,
    /// Who can publish.
    pub publisher_model: PublisherModel,
    /// Whether subscriptions are accepted at all.
    pub subscription_enabled: bool,
    /// Whether one entity may hold several subscriptions.
    pub multiple_subscriptions: bool,
    /// Whether notifications carry the item payload.
    pub deliver_payloads: bool,
    /// Whether published items are written to storage.
    pub persist_items: bool,
    /// Bound on the retained item history.
    pub max_items: u32,
    /// Whether retractions are broadcast.
    pub notify_retract: bool,
    /// Whether node deletion is broadcast.
    pub notify_delete: bool,
    /// Whether configuration changes are broadcast.
    pub notify_config: bool,
    /// Whether delivery requires an available presence, node-wide.
    pub presence_based_delivery: bool,
    /// When to send the newest item to a fresh subscription.
    pub send_last_published_item: SendLastPublishedItem,
    /// Roster groups admitted under the roster access model.
    pub roster_groups_allowed: Vec<String>,
    /// Collection policy: who may associate new leaves.
    pub association_policy: AssociationPolicy,
    /// Collection policy: leaf cap, -1 for unbounded.
    pub max_leaf_nodes: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_default()
    }
}

impl NodeConfig {
    /// Service default for leaf nodes.
    pub fn leaf_default() -> Self {
        Self {
            title: String::new(),
            description: None,
            access_model: AccessModel::Open,
            publisher_model: PublisherModel::Publishers,
            subscription_enabled: true,
            multiple_subscriptions: true,
            deliver_payloads: true,
            persist_items: true,
            max_items: 50,
            notify_retract: true,
            notify_delete: true,
            notify_config: true,
            presence_based_delivery: false,
            send_last_published_item: SendLastPublishedItem::OnSub,
            roster_groups_allowed: Vec::new(),
            association_policy: AssociationPolicy::All,
            max_leaf_nodes: -1,
        }
    }

    /// Service default for collection nodes.
    pub fn collection_default() -> Self {
        Self {
            deliver_payloads: false,
            persist_items: false,
            send_last_published_item: SendLastPublishedItem::Never,
            ..Self::leaf_default()
        }
    }

    /// Whether publish requests must carry `<item/>` children.
    ///
    /// Derived rather than configured: a node that persists items or
    /// delivers payloads has something to persist or deliver.
    pub fn item_required(&self) -> bool {
        self.persist_items || self.deliver_payloads
    }

    /// Apply a submitted `pubsub#node_config` form.
    ///
    /// Unknown fields are ignored; absent fields keep their current
    /// value. Returns the new owner list when the form carried a
    /// `pubsub#owner` field (validation is the caller's business).
    pub fn apply_form(&mut self, form: &SubmittedForm) -> Option<Vec<BareJid>> {
        if let Some(title) = form.value("pubsub#title") {
            self.title = title.to_string();
        }
        if let Some(description) = form.value("pubsub#description") {
            self.description = if description.is_empty() {
                None
            } else {
                Some(description.to_string())
            };
        }
        if let Some(model) = form.value("pubsub#access_model").and_then(AccessModel::from_str) {
            self.access_model = model;
        }
        if let Some(model) = form
            .value("pubsub#publish_model")
            .and_then(PublisherModel::from_str)
        {
            self.publisher_model = model;
        }
        if let Some(v) = form.bool_value("pubsub#subscribe") {
            self.subscription_enabled = v;
        }
        if let Some(v) = form.bool_value("pubsub#multiple_subscriptions") {
            self.multiple_subscriptions = v;
        }
        if let Some(v) = form.bool_value("pubsub#deliver_payloads") {
            self.deliver_payloads = v;
        }
        if let Some(v) = form.bool_value("pubsub#persist_items") {
            self.persist_items = v;
        }
        if let Some(v) = form.value("pubsub#max_items").and_then(|s| s.parse().ok()) {
            self.max_items = v;
        }
        if let Some(v) = form.bool_value("pubsub#notify_retract") {
            self.notify_retract = v;
        }
        if let Some(v) = form.bool_value("pubsub#notify_delete") {
            self.notify_delete = v;
        }
        if let Some(v) = form.bool_value("pubsub#notify_config") {
            self.notify_config = v;
        }
        if let Some(v) = form.bool_value("pubsub#presence_based_delivery") {
            self.presence_based_delivery = v;
        }
        if let Some(v) = form
            .value("pubsub#send_last_published_item")
            .and_then(SendLastPublishedItem::from_str)
        {
            self.send_last_published_item = v;
        }
        if form.has_field("pubsub#roster_groups_allowed") {
            self.roster_groups_allowed = form.values("pubsub#roster_groups_allowed").to_vec();
        }
        if let Some(policy) = form
            .value("pubsub#leaf_node_association_policy")
            .and_then(AssociationPolicy::from_str)
        {
            self.association_policy = policy;
        }
        if let Some(v) = form
            .value("pubsub#leaf_nodes_max")
            .and_then(|s| s.parse().ok())
        {
            self.max_leaf_nodes = v;
        }

        if form.has_field("pubsub#owner") {
            let owners: Vec<BareJid> = form
                .values("pubsub#owner")
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            return Some(owners);
        }
        None
    }

    /// Build the configuration form for owner retrieval.
    ///
    /// `owners` and `parent` live on the node, not in this record, so
    /// the caller passes them in.
    pub fn to_form(
        &self,
        is_collection: bool,
        owners: &[BareJid],
        parent: Option<&str>,
    ) -> Element {
        let mut form = form_element("form");
        form.append_child(build_field_hidden("FORM_TYPE", FORM_TYPE_NODE_CONFIG));
        form.append_child(build_field_text_single(
            "pubsub#title",
            "Node title",
            &self.title,
        ));
        form.append_child(build_field_text_single(
            "pubsub#description",
            "Node description",
            self.description.as_deref().unwrap_or(""),
        ));
        form.append_child(build_field_list_single(
            "pubsub#access_model",
            "Who may subscribe and retrieve items",
            &self.access_model.to_string(),
            &["open", "presence", "roster", "authorize", "whitelist"],
        ));
        form.append_child(build_field_list_single(
            "pubsub#publish_model",
            "Who may publish items",
            &self.publisher_model.to_string(),
            &["publishers", "subscribers", "open"],
        ));
        form.append_child(build_field_boolean(
            "pubsub#subscribe",
            "Allow subscriptions",
            self.subscription_enabled,
        ));
        form.append_child(build_field_boolean(
            "pubsub#multiple_subscriptions",
            "Allow multiple subscriptions per entity",
            self.multiple_subscriptions,
        ));
        let owner_values: Vec<String> = owners.iter().map(|o| o.to_string()).collect();
        form.append_child(build_field_multi(
            "pubsub#owner",
            "jid-multi",
            "Node owners",
            &owner_values,
        ));
        if let Some(parent) = parent {
            form.append_child(build_field_text_single(
                "pubsub#collection",
                "Parent collection",
                parent,
            ));
        }

        if is_collection {
            form.append_child(build_field_list_single(
                "pubsub#leaf_node_association_policy",
                "Who may associate leaf nodes",
                &self.association_policy.to_string(),
                &["all", "owners"],
            ));
            form.append_child(build_field_text_single(
                "pubsub#leaf_nodes_max",
                "Maximum number of leaf nodes",
                &self.max_leaf_nodes.to_string(),
            ));
        } else {
            form.append_child(build_field_boolean(
                "pubsub#deliver_payloads",
                "Deliver payloads with event notifications",
                self.deliver_payloads,
            ));
            form.append_child(build_field_boolean(
                "pubsub#persist_items",
                "Persist items to storage",
                self.persist_items,
            ));
            form.append_child(build_field_text_single(
                "pubsub#max_items",
                "Max number of items to persist",
                &self.max_items.to_string(),
            ));
            form.append_child(build_field_boolean(
                "pubsub#notify_retract",
                "Notify subscribers when items are removed",
                self.notify_retract,
            ));
            form.append_child(build_field_boolean(
                "pubsub#notify_delete",
                "Notify subscribers when the node is deleted",
                self.notify_delete,
            ));
            form.append_child(build_field_boolean(
                "pubsub#notify_config",
                "Notify subscribers when the configuration changes",
                self.notify_config,
            ));
            form.append_child(build_field_boolean(
                "pubsub#presence_based_delivery",
                "Deliver only to available subscribers",
                self.presence_based_delivery,
            ));
            form.append_child(build_field_list_single(
                "pubsub#send_last_published_item",
                "When to send the last published item",
                &self.send_last_published_item.to_string(),
                &["never", "on_sub"],
            ));
        }
        form.append_child(build_field_multi(
            "pubsub#roster_groups_allowed",
            "list-multi",
            "Roster groups allowed to subscribe",
            &self.roster_groups_allowed,
        ));

        form
    }
}

/// Defaults registry: one record per node kind.
#[derive(Debug, Clone)]
pub struct DefaultConfigs {
    /// Seed for new leaf nodes.
    pub leaf: NodeConfig,
    /// Seed for new collection nodes.
    pub collection: NodeConfig,
}

impl Default for DefaultConfigs {
    fn default() -> Self {
        Self {
            leaf: NodeConfig::leaf_default(),
            collection: NodeConfig::collection_default(),
        }
    }
}

/// Parse the boolean notify attribute used on retract requests.
pub fn notify_attr(elem: &Element) -> bool {
    elem.attr("notify").map(parse_boolean).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_defaults() {
        let config = NodeConfig::leaf_default();
        assert_eq!(config.access_model, AccessModel::Open);
        assert_eq!(config.publisher_model, PublisherModel::Publishers);
        assert!(config.persist_items);
        assert_eq!(config.max_items, 50);
        assert!(config.item_required());
    }

    #[test]
    fn test_collection_defaults() {
        let config = NodeConfig::collection_default();
        assert!(!config.persist_items);
        assert!(!config.deliver_payloads);
        assert_eq!(config.max_leaf_nodes, -1);
        assert!(!config.item_required());
    }

    #[test]
    fn test_item_required_derivation() {
        let mut config = NodeConfig::leaf_default();
        config.persist_items = false;
        config.deliver_payloads = false;
        assert!(!config.item_required());

        config.deliver_payloads = true;
        assert!(config.item_required());
    }

    #[test]
    fn test_apply_form_updates_fields() {
        let mut config = NodeConfig::leaf_default();
        let mut form = SubmittedForm::default();
        form.set("pubsub#access_model", vec!["authorize".to_string()]);
        form.set("pubsub#max_items", vec!["7".to_string()]);
        form.set("pubsub#persist_items", vec!["0".to_string()]);
        form.set("pubsub#title", vec!["Blog".to_string()]);

        let owners = config.apply_form(&form);
        assert!(owners.is_none());
        assert_eq!(config.access_model, AccessModel::Authorize);
        assert_eq!(config.max_items, 7);
        assert!(!config.persist_items);
        assert_eq!(config.title, "Blog");
        // untouched field keeps its default
        assert!(config.subscription_enabled);
    }

    #[test]
    fn test_apply_form_returns_owner_list() {
        let mut config = NodeConfig::leaf_default();
        let mut form = SubmittedForm::default();
        form.set(
            "pubsub#owner",
            vec!["alice@rookery.chat".to_string(), "bob@rookery.chat".to_string()],
        );

        let owners = config.apply_form(&form).expect("owner field");
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn test_form_round_trip_recognized_fields() {
        let mut config = NodeConfig::leaf_default();
        config.access_model = AccessModel::Whitelist;
        config.max_items = 3;
        config.title = "News".to_string();

        let owner: BareJid = "alice@rookery.chat".parse().unwrap();
        let elem = config.to_form(false, &[owner], None);
        let form = SubmittedForm::from_element(&elem).expect("parsed back");

        let mut round_tripped = NodeConfig::leaf_default();
        round_tripped.apply_form(&form);
        assert_eq!(round_tripped.access_model, AccessModel::Whitelist);
        assert_eq!(round_tripped.max_items, 3);
        assert_eq!(round_tripped.title, "News");
    }
}
