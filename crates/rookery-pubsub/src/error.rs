//! Error types for the PubSub engine.
//!
//! Every failed request maps onto a base XMPP stanza error condition
//! (RFC 6120) optionally refined by an application condition in the
//! `http://jabber.org/protocol/pubsub#errors` namespace. The dispatcher
//! converts a [`PubSubError`] into an error IQ; nothing is ever raised
//! to the transport.

use minidom::Element;
use thiserror::Error;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// PubSub application error namespace.
pub const NS_PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";

/// Application-specific error condition carried next to the base condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubCondition {
    /// A node id was required but absent.
    NodeIdRequired,
    /// An item (or item id) was required but absent.
    ItemRequired,
    /// Items were supplied to a node that takes none.
    ItemForbidden,
    /// A payload was required but absent.
    PayloadRequired,
    /// An item carried more than one payload element.
    InvalidPayload,
    /// The requested JID does not match the sender.
    InvalidJid,
    /// The supplied subscription id matches no subscription.
    InvalidSubId,
    /// A subscription id was required but absent.
    SubIdRequired,
    /// A jid attribute was required but absent.
    JidRequired,
    /// The sender holds no subscription on the node.
    NotSubscribed,
    /// The subscription is still waiting for owner approval.
    PendingSubscription,
    /// The parent collection cannot take more leaf nodes.
    MaxNodesExceeded,
    /// The presence access model admitted no resource of the sender.
    PresenceSubscriptionRequired,
    /// The roster access model admitted no group of the sender.
    NotInRosterGroup,
    /// The whitelist access model excludes the sender.
    ClosedNode,
    /// The service does not implement the named feature.
    Unsupported {
        /// XEP-0060 feature name, e.g. `collections` or `persistent-items`.
        feature: &'static str,
    },
}

impl PubSubCondition {
    fn element_name(&self) -> &'static str {
        match self {
            PubSubCondition::NodeIdRequired => "nodeid-required",
            PubSubCondition::ItemRequired => "item-required",
            PubSubCondition::ItemForbidden => "item-forbidden",
            PubSubCondition::PayloadRequired => "payload-required",
            PubSubCondition::InvalidPayload => "invalid-payload",
            PubSubCondition::InvalidJid => "invalid-jid",
            PubSubCondition::InvalidSubId => "invalid-subid",
            PubSubCondition::SubIdRequired => "subid-required",
            PubSubCondition::JidRequired => "jid-required",
            PubSubCondition::NotSubscribed => "not-subscribed",
            PubSubCondition::PendingSubscription => "pending-subscription",
            PubSubCondition::MaxNodesExceeded => "max-nodes-exceeded",
            PubSubCondition::PresenceSubscriptionRequired => "presence-subscription-required",
            PubSubCondition::NotInRosterGroup => "not-in-roster-group",
            PubSubCondition::ClosedNode => "closed-node",
            PubSubCondition::Unsupported { .. } => "unsupported",
        }
    }

    /// Build the `#errors` namespace element for this condition.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder(self.element_name(), NS_PUBSUB_ERRORS);
        if let PubSubCondition::Unsupported { feature } = self {
            builder = builder.attr("feature", *feature);
        }
        builder.build()
    }
}

/// A typed PubSub request failure.
///
/// Constructed by handlers through the helper constructors and turned
/// into an error IQ at the dispatch boundary.
#[derive(Debug, Clone, Error)]
#[error("pubsub error: {condition:?} ({payload:?})")]
pub struct PubSubError {
    /// Base XMPP error condition.
    pub condition: DefinedCondition,
    /// RFC 6120 error type attribute.
    pub error_type: ErrorType,
    /// Optional application condition in the `#errors` namespace.
    pub payload: Option<PubSubCondition>,
    /// Optional human-readable text.
    pub text: Option<String>,
}

impl PubSubError {
    fn new(
        condition: DefinedCondition,
        error_type: ErrorType,
        payload: Option<PubSubCondition>,
    ) -> Self {
        Self {
            condition,
            error_type,
            payload,
            text: None,
        }
    }

    /// Attach a human-readable text to the error.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Malformed request, optionally refined by an application condition.
    pub fn bad_request(payload: Option<PubSubCondition>) -> Self {
        Self::new(DefinedCondition::BadRequest, ErrorType::Modify, payload)
    }

    /// Request valid but unacceptable in the node's current configuration.
    pub fn not_acceptable(payload: Option<PubSubCondition>) -> Self {
        Self::new(DefinedCondition::NotAcceptable, ErrorType::Modify, payload)
    }

    /// Sender lacks the required affiliation or role.
    pub fn forbidden() -> Self {
        Self::new(DefinedCondition::Forbidden, ErrorType::Auth, None)
    }

    /// Operation disabled by node or service policy.
    pub fn not_allowed(payload: Option<PubSubCondition>) -> Self {
        Self::new(DefinedCondition::NotAllowed, ErrorType::Cancel, payload)
    }

    /// Sender not authorized under the node's access model.
    pub fn not_authorized(payload: Option<PubSubCondition>) -> Self {
        Self::new(DefinedCondition::NotAuthorized, ErrorType::Auth, payload)
    }

    /// Unknown node, item, or subscription.
    pub fn item_not_found() -> Self {
        Self::new(DefinedCondition::ItemNotFound, ErrorType::Cancel, None)
    }

    /// Duplicate node id or subscription.
    pub fn conflict(payload: Option<PubSubCondition>) -> Self {
        Self::new(DefinedCondition::Conflict, ErrorType::Cancel, payload)
    }

    /// Feature not implemented by this service or node type.
    pub fn unsupported(feature: &'static str) -> Self {
        Self::new(
            DefinedCondition::FeatureNotImplemented,
            ErrorType::Cancel,
            Some(PubSubCondition::Unsupported { feature }),
        )
    }

    /// Operation invalid in the current subscription state.
    pub fn unexpected_request(payload: Option<PubSubCondition>) -> Self {
        Self::new(DefinedCondition::UnexpectedRequest, ErrorType::Cancel, payload)
    }

    /// Backend failure surfaced to the requester.
    pub fn internal_server_error() -> Self {
        Self::new(DefinedCondition::InternalServerError, ErrorType::Wait, None)
    }

    /// Convert into the wire-level stanza error.
    pub fn to_stanza_error(&self) -> StanzaError {
        let mut error = StanzaError::new(
            self.error_type.clone(),
            self.condition.clone(),
            "en",
            self.text.as_deref().unwrap_or(""),
        );
        error.other = self.payload.as_ref().map(PubSubCondition::to_element);
        error
    }

    /// Build the error reply for a request IQ.
    pub fn error_iq(&self, request: &Iq) -> Iq {
        Iq {
            from: request.to.clone(),
            to: request.from.clone(),
            id: request.id.clone(),
            payload: IqType::Error(self.to_stanza_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_element_names() {
        assert_eq!(
            PubSubCondition::NodeIdRequired.to_element().name(),
            "nodeid-required"
        );
        assert_eq!(
            PubSubCondition::MaxNodesExceeded.to_element().name(),
            "max-nodes-exceeded"
        );
    }

    #[test]
    fn test_unsupported_carries_feature_attr() {
        let elem = PubSubCondition::Unsupported {
            feature: "collections",
        }
        .to_element();
        assert_eq!(elem.name(), "unsupported");
        assert_eq!(elem.attr("feature"), Some("collections"));
        assert_eq!(elem.ns(), NS_PUBSUB_ERRORS);
    }

    #[test]
    fn test_error_iq_swaps_addresses() {
        let request = Iq {
            from: Some("alice@rookery.chat/desk".parse().unwrap()),
            to: Some("pubsub.rookery.chat".parse().unwrap()),
            id: "c1".to_string(),
            payload: IqType::Set(Element::builder("pubsub", "ns").build()),
        };

        let err = PubSubError::bad_request(Some(PubSubCondition::NodeIdRequired));
        let reply = err.error_iq(&request);

        assert_eq!(reply.id, "c1");
        assert_eq!(reply.from, request.to);
        assert_eq!(reply.to, request.from);
        match reply.payload {
            IqType::Error(stanza_error) => {
                assert_eq!(stanza_error.defined_condition, DefinedCondition::BadRequest);
                let other = stanza_error.other.expect("application condition");
                assert_eq!(other.name(), "nodeid-required");
            }
            _ => panic!("Expected error payload"),
        }
    }
}
