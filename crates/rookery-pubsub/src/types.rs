//! Common types for the PubSub engine.

use serde::{Deserialize, Serialize};

/// Affiliation of an entity with a node.
///
/// Ordered from least to most privileged so that `max` picks the
/// strongest affiliation when several apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Affiliation {
    /// Banned from the node
    Outcast,
    /// No affiliation
    None,
    /// May subscribe and retrieve items
    Member,
    /// May publish items
    Publisher,
    /// Node owner
    Owner,
}

impl Affiliation {
    /// Parse an affiliation from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "outcast" => Some(Affiliation::Outcast),
            "none" => Some(Affiliation::None),
            "member" => Some(Affiliation::Member),
            "publisher" => Some(Affiliation::Publisher),
            "owner" => Some(Affiliation::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affiliation::Outcast => write!(f, "outcast"),
            Affiliation::None => write!(f, "none"),
            Affiliation::Member => write!(f, "member"),
            Affiliation::Publisher => write!(f, "publisher"),
            Affiliation::Owner => write!(f, "owner"),
        }
    }
}

/// State of a subscription to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Not subscribed (tombstone state, rarely stored)
    None,
    /// Waiting for owner approval (authorize access model)
    Pending,
    /// Approved but required configuration not yet submitted
    Unconfigured,
    /// Active subscription
    Subscribed,
}

impl SubscriptionState {
    /// Parse a subscription state from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SubscriptionState::None),
            "pending" => Some(SubscriptionState::Pending),
            "unconfigured" => Some(SubscriptionState::Unconfigured),
            "subscribed" => Some(SubscriptionState::Subscribed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::None => write!(f, "none"),
            SubscriptionState::Pending => write!(f, "pending"),
            SubscriptionState::Unconfigured => write!(f, "unconfigured"),
            SubscriptionState::Subscribed => write!(f, "subscribed"),
        }
    }
}

/// What a subscription delivers: published items, or child-node events
/// (the latter only meaningful on collection subscriptions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriptionType {
    /// Deliver published items
    #[default]
    Items,
    /// Deliver node lifecycle events of child nodes
    Nodes,
}

impl SubscriptionType {
    /// Parse a subscription type from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "items" => Some(SubscriptionType::Items),
            "nodes" => Some(SubscriptionType::Nodes),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionType::Items => write!(f, "items"),
            SubscriptionType::Nodes => write!(f, "nodes"),
        }
    }
}

/// Access model for a node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    #[default]
    Open,
    /// Only entities the presence tracker currently knows about.
    Presence,
    /// Only entities in the allowed roster groups.
    Roster,
    /// Subscriptions require owner approval.
    Authorize,
    /// Only explicitly whitelisted JIDs.
    Whitelist,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "authorize" => Some(AccessModel::Authorize),
            "whitelist" => Some(AccessModel::Whitelist),
            _ => None,
        }
    }

    /// Whether new subscriptions start in the pending state.
    pub fn requires_authorization(&self) -> bool {
        matches!(self, AccessModel::Authorize)
    }
}

impl std::fmt::Display for AccessModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Authorize => "authorize",
            AccessModel::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Publisher model for a node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PublisherModel {
    /// Only owners and publishers can publish.
    #[default]
    Publishers,
    /// Owners, publishers, and subscribers can publish.
    Subscribers,
    /// Anyone but outcasts can publish.
    Open,
}

impl PublisherModel {
    /// Parse a publisher model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(PublisherModel::Publishers),
            "subscribers" => Some(PublisherModel::Subscribers),
            "open" => Some(PublisherModel::Open),
            _ => None,
        }
    }

    /// Whether an entity with the given affiliation and subscription
    /// status may publish under this model.
    pub fn can_publish(&self, affiliation: Affiliation, is_subscriber: bool) -> bool {
        if affiliation == Affiliation::Outcast {
            return false;
        }
        match self {
            PublisherModel::Publishers => {
                matches!(affiliation, Affiliation::Owner | Affiliation::Publisher)
            }
            PublisherModel::Subscribers => {
                matches!(affiliation, Affiliation::Owner | Affiliation::Publisher) || is_subscriber
            }
            PublisherModel::Open => true,
        }
    }
}

impl std::fmt::Display for PublisherModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PublisherModel::Publishers => "publishers",
            PublisherModel::Subscribers => "subscribers",
            PublisherModel::Open => "open",
        };
        write!(f, "{}", s)
    }
}

/// Policy for associating leaf nodes with a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssociationPolicy {
    /// Anyone may create leaves under the collection.
    #[default]
    All,
    /// Only collection owners may create leaves under it.
    Owners,
}

impl AssociationPolicy {
    /// Parse an association policy from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "all" => Some(AssociationPolicy::All),
            "owners" => Some(AssociationPolicy::Owners),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssociationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssociationPolicy::All => "all",
            AssociationPolicy::Owners => "owners",
        };
        write!(f, "{}", s)
    }
}

/// When to send the newest item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendLastPublishedItem {
    /// Never send the last item automatically.
    Never,
    /// Send when a subscription becomes active.
    #[default]
    OnSub,
}

impl SendLastPublishedItem {
    /// Parse from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SendLastPublishedItem::Never),
            "on_sub" => Some(SendLastPublishedItem::OnSub),
            _ => None,
        }
    }
}

impl std::fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SendLastPublishedItem::Never => "never",
            SendLastPublishedItem::OnSub => "on_sub",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affiliation_ordering() {
        assert!(Affiliation::Owner > Affiliation::Publisher);
        assert!(Affiliation::Publisher > Affiliation::Member);
        assert!(Affiliation::Member > Affiliation::None);
        assert!(Affiliation::None > Affiliation::Outcast);
    }

    #[test]
    fn test_affiliation_round_trip() {
        for a in [
            Affiliation::Outcast,
            Affiliation::None,
            Affiliation::Member,
            Affiliation::Publisher,
            Affiliation::Owner,
        ] {
            assert_eq!(Affiliation::from_str(&a.to_string()), Some(a));
        }
        assert_eq!(Affiliation::from_str("admin"), None);
    }

    #[test]
    fn test_access_model_parse() {
        assert_eq!(AccessModel::from_str("open"), Some(AccessModel::Open));
        assert_eq!(AccessModel::from_str("authorize"), Some(AccessModel::Authorize));
        assert_eq!(AccessModel::from_str("invalid"), None);
        assert!(AccessModel::Authorize.requires_authorization());
        assert!(!AccessModel::Open.requires_authorization());
    }

    #[test]
    fn test_publisher_model_can_publish() {
        let open = PublisherModel::Open;
        assert!(open.can_publish(Affiliation::None, false));
        assert!(!open.can_publish(Affiliation::Outcast, true));

        let publishers = PublisherModel::Publishers;
        assert!(publishers.can_publish(Affiliation::Owner, false));
        assert!(publishers.can_publish(Affiliation::Publisher, false));
        assert!(!publishers.can_publish(Affiliation::Member, true));

        let subscribers = PublisherModel::Subscribers;
        assert!(subscribers.can_publish(Affiliation::Member, true));
        assert!(!subscribers.can_publish(Affiliation::Member, false));
    }

    #[test]
    fn test_subscription_state_display() {
        assert_eq!(SubscriptionState::Pending.to_string(), "pending");
        assert_eq!(SubscriptionState::Subscribed.to_string(), "subscribed");
    }
}
