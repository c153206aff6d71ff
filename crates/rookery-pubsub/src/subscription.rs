//! Per-node subscriptions and their configuration.

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;

use crate::forms::{
    build_field_boolean, build_field_hidden, build_field_list_single, build_field_multi,
    build_field_text_single, form_element, SubmittedForm, FORM_TYPE_SUBSCRIBE_OPTIONS,
};
use crate::item::PublishedItem;
use crate::types::{SubscriptionState, SubscriptionType};

/// How deep a collection subscription reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionDepth {
    /// Direct children only.
    #[default]
    One,
    /// The whole subtree.
    All,
}

impl SubscriptionDepth {
    /// Parse a depth from its form value ("1" or "all").
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1" => Some(SubscriptionDepth::One),
            "all" => Some(SubscriptionDepth::All),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionDepth::One => write!(f, "1"),
            SubscriptionDepth::All => write!(f, "all"),
        }
    }
}

/// Configuration of a single subscription (XEP-0060 subscribe options).
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Master delivery toggle.
    pub deliver: bool,
    /// Coalesce a publish batch into one event message.
    pub digest: bool,
    /// Echo the payload text in a message body.
    pub include_body: bool,
    /// Show values admitted for delivery; empty admits all.
    pub show_values: Vec<String>,
    /// Items or child-node events.
    pub subscription_type: SubscriptionType,
    /// Collection subscription depth.
    pub depth: SubscriptionDepth,
    /// Substring filter over item payloads.
    pub keyword: Option<String>,
    /// Deliver only while the subscriber is available.
    pub presence_based_delivery: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            digest: false,
            include_body: false,
            show_values: Vec::new(),
            subscription_type: SubscriptionType::Items,
            depth: SubscriptionDepth::One,
            keyword: None,
            presence_based_delivery: false,
        }
    }
}

impl SubscriptionOptions {
    /// Apply a submitted `pubsub#subscribe_options` form.
    pub fn apply_form(&mut self, form: &SubmittedForm) {
        if let Some(v) = form.bool_value("pubsub#deliver") {
            self.deliver = v;
        }
        if let Some(v) = form.bool_value("pubsub#digest") {
            self.digest = v;
        }
        if let Some(v) = form.bool_value("pubsub#include_body") {
            self.include_body = v;
        }
        if form.has_field("pubsub#show-values") {
            self.show_values = form.values("pubsub#show-values").to_vec();
        }
        if let Some(v) = form
            .value("pubsub#subscription_type")
            .and_then(SubscriptionType::from_str)
        {
            self.subscription_type = v;
        }
        if let Some(v) = form
            .value("pubsub#subscription_depth")
            .and_then(SubscriptionDepth::from_str)
        {
            self.depth = v;
        }
        if form.has_field("pubsub#keywords") {
            let keyword = form.value("pubsub#keywords").unwrap_or("");
            self.keyword = if keyword.is_empty() {
                None
            } else {
                Some(keyword.to_string())
            };
        }
        if let Some(v) = form.bool_value("pubsub#presence_based_delivery") {
            self.presence_based_delivery = v;
        }
    }

    /// Build the options form for retrieval.
    pub fn to_form(&self) -> Element {
        let mut form = form_element("form");
        form.append_child(build_field_hidden("FORM_TYPE", FORM_TYPE_SUBSCRIBE_OPTIONS));
        form.append_child(build_field_boolean(
            "pubsub#deliver",
            "Deliver event notifications",
            self.deliver,
        ));
        form.append_child(build_field_boolean(
            "pubsub#digest",
            "Deliver a digest per publish batch",
            self.digest,
        ));
        form.append_child(build_field_boolean(
            "pubsub#include_body",
            "Include the payload text as a message body",
            self.include_body,
        ));
        form.append_child(build_field_multi(
            "pubsub#show-values",
            "list-multi",
            "Presence show values admitting delivery",
            &self.show_values,
        ));
        form.append_child(build_field_list_single(
            "pubsub#subscription_type",
            "Subscription type",
            &self.subscription_type.to_string(),
            &["items", "nodes"],
        ));
        form.append_child(build_field_list_single(
            "pubsub#subscription_depth",
            "Subscription depth",
            &self.depth.to_string(),
            &["1", "all"],
        ));
        form.append_child(build_field_text_single(
            "pubsub#keywords",
            "Only deliver items whose payload contains",
            self.keyword.as_deref().unwrap_or(""),
        ));
        form.append_child(build_field_boolean(
            "pubsub#presence_based_delivery",
            "Deliver only to available resources",
            self.presence_based_delivery,
        ));
        form
    }
}

/// A subscriber's registration on a node.
///
/// Identified by `(node, id)`; when the node disallows multiple
/// subscriptions, `(node, subscriber)` is also unique.
#[derive(Debug, Clone)]
pub struct NodeSubscription {
    /// Service-generated subscription id.
    pub id: String,
    /// Bare JID that owns the subscription.
    pub owner: BareJid,
    /// Delivery address; may carry a resource.
    pub jid: Jid,
    /// Current lifecycle state.
    pub state: SubscriptionState,
    /// Per-subscription configuration.
    pub options: SubscriptionOptions,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
}

impl NodeSubscription {
    /// Create a subscription in the given initial state.
    pub fn new(id: String, owner: BareJid, jid: Jid, state: SubscriptionState) -> Self {
        Self {
            id,
            owner,
            jid,
            state,
            options: SubscriptionOptions::default(),
            created_at: Utc::now(),
        }
    }

    /// Whether events are currently deliverable to this subscription.
    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Subscribed
    }

    /// Whether any of the subscriber's current show values is admitted.
    ///
    /// An empty allow-list admits every show value.
    pub fn admits_show(&self, shows: &[String]) -> bool {
        if self.options.show_values.is_empty() {
            return !shows.is_empty();
        }
        shows.iter().any(|s| self.options.show_values.contains(s))
    }

    /// Whether the keyword filter admits the item.
    pub fn admits_item(&self, item: &PublishedItem) -> bool {
        match self.options.keyword.as_deref() {
            Some(keyword) => item.matches_keyword(keyword),
            None => true,
        }
    }

    /// Build a `<subscription/>` status element.
    pub fn to_element(&self, ns: &str, node_attr: Option<&str>, include_subid: bool) -> Element {
        let mut builder = Element::builder("subscription", ns)
            .attr("jid", self.jid.to_string().as_str())
            .attr("subscription", self.state.to_string().as_str());
        if let Some(node) = node_attr {
            builder = builder.attr("node", node);
        }
        if include_subid {
            builder = builder.attr("subid", self.id.as_str());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(state: SubscriptionState) -> NodeSubscription {
        NodeSubscription::new(
            "sub1".to_string(),
            "bob@rookery.chat".parse().unwrap(),
            "bob@rookery.chat/r1".parse().unwrap(),
            state,
        )
    }

    #[test]
    fn test_options_form_round_trip() {
        let mut options = SubscriptionOptions::default();
        options.digest = true;
        options.keyword = Some("rust".to_string());
        options.show_values = vec!["online".to_string(), "away".to_string()];
        options.include_body = true;

        let elem = options.to_form();
        let form = SubmittedForm::from_element(&elem).expect("parsed back");

        let mut round_tripped = SubscriptionOptions::default();
        round_tripped.apply_form(&form);
        assert!(round_tripped.digest);
        assert!(round_tripped.include_body);
        assert_eq!(round_tripped.keyword.as_deref(), Some("rust"));
        assert_eq!(round_tripped.show_values, options.show_values);
        assert_eq!(round_tripped.subscription_type, SubscriptionType::Items);
    }

    #[test]
    fn test_admits_show() {
        let mut sub = subscription(SubscriptionState::Subscribed);
        // empty allow-list admits anything, but not absence
        assert!(sub.admits_show(&["dnd".to_string()]));
        assert!(!sub.admits_show(&[]));

        sub.options.show_values = vec!["away".to_string()];
        assert!(sub.admits_show(&["online".to_string(), "away".to_string()]));
        assert!(!sub.admits_show(&["online".to_string()]));
    }

    #[test]
    fn test_admits_item_keyword_filter() {
        let mut sub = subscription(SubscriptionState::Subscribed);
        let item = PublishedItem::new(
            "/blog".to_string(),
            "i1".to_string(),
            "alice@rookery.chat".parse().unwrap(),
            Some("<entry xmlns='urn:test'>rust weekly</entry>".parse().unwrap()),
        );

        assert!(sub.admits_item(&item), "no filter admits everything");

        sub.options.keyword = Some("rust".to_string());
        assert!(sub.admits_item(&item));

        sub.options.keyword = Some("golang".to_string());
        assert!(!sub.admits_item(&item));
    }

    #[test]
    fn test_is_active() {
        assert!(subscription(SubscriptionState::Subscribed).is_active());
        assert!(!subscription(SubscriptionState::Pending).is_active());
        assert!(!subscription(SubscriptionState::Unconfigured).is_active());
    }

    #[test]
    fn test_to_element_attrs() {
        let sub = subscription(SubscriptionState::Pending);
        let elem = sub.to_element("ns", Some("/blog"), true);
        assert_eq!(elem.attr("node"), Some("/blog"));
        assert_eq!(elem.attr("jid"), Some("bob@rookery.chat/r1"));
        assert_eq!(elem.attr("subscription"), Some("pending"));
        assert_eq!(elem.attr("subid"), Some("sub1"));

        let bare = sub.to_element("ns", None, false);
        assert!(bare.attr("node").is_none());
        assert!(bare.attr("subid").is_none());
    }
}
