//! Published items.

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;

/// An item held by a leaf node, identified by `(node, id)`.
#[derive(Debug, Clone)]
pub struct PublishedItem {
    /// Owning node id.
    pub node_id: String,
    /// Item id, unique within the node.
    pub id: String,
    /// Who published it.
    pub publisher: Jid,
    /// The payload element, if any.
    pub payload: Option<Element>,
    /// When the item was published.
    pub published_at: DateTime<Utc>,
}

impl PublishedItem {
    /// Create a new item stamped with the current time.
    pub fn new(node_id: String, id: String, publisher: Jid, payload: Option<Element>) -> Self {
        Self {
            node_id,
            id,
            publisher,
            payload,
            published_at: Utc::now(),
        }
    }

    /// The publisher's bare JID.
    pub fn publisher_bare(&self) -> BareJid {
        self.publisher.to_bare()
    }

    /// Whether the requester may retract this item.
    ///
    /// Owners, the original publisher, and service admins qualify.
    pub fn can_delete(&self, requester: &BareJid, is_owner: bool, is_admin: bool) -> bool {
        is_owner || is_admin || self.publisher_bare() == *requester
    }

    /// Whether the payload text contains the given keyword.
    ///
    /// Items without a payload never match.
    pub fn matches_keyword(&self, keyword: &str) -> bool {
        self.payload
            .as_ref()
            .map(|p| String::from(p).contains(keyword))
            .unwrap_or(false)
    }

    /// Build an `<item/>` element, optionally including the payload.
    pub fn to_element(&self, ns: &str, include_payload: bool) -> Element {
        let mut builder = Element::builder("item", ns).attr("id", self.id.as_str());
        if include_payload {
            if let Some(ref payload) = self.payload {
                builder = builder.append(payload.clone());
            }
        }
        builder.build()
    }

    /// Concatenated text content of the payload, for include-body delivery.
    pub fn payload_text(&self) -> String {
        self.payload.as_ref().map(|p| p.text()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(publisher: &str, payload: Option<&str>) -> PublishedItem {
        PublishedItem::new(
            "/blog".to_string(),
            "i1".to_string(),
            publisher.parse().expect("valid jid"),
            payload.map(|xml| xml.parse().expect("valid XML")),
        )
    }

    #[test]
    fn test_can_delete() {
        let it = item("alice@rookery.chat/desk", None);
        let alice: BareJid = "alice@rookery.chat".parse().unwrap();
        let mallory: BareJid = "mallory@rookery.chat".parse().unwrap();

        assert!(it.can_delete(&alice, false, false), "publisher may delete");
        assert!(it.can_delete(&mallory, true, false), "owner may delete");
        assert!(it.can_delete(&mallory, false, true), "admin may delete");
        assert!(!it.can_delete(&mallory, false, false));
    }

    #[test]
    fn test_keyword_match_on_payload() {
        let it = item(
            "alice@rookery.chat",
            Some("<entry xmlns='urn:test'>rust news</entry>"),
        );
        assert!(it.matches_keyword("rust"));
        assert!(!it.matches_keyword("golang"));

        let empty = item("alice@rookery.chat", None);
        assert!(!empty.matches_keyword("rust"));
    }

    #[test]
    fn test_to_element_payload_toggle() {
        let it = item("alice@rookery.chat", Some("<entry xmlns='urn:test'>hi</entry>"));

        let with = it.to_element("ns", true);
        assert_eq!(with.attr("id"), Some("i1"));
        assert_eq!(with.children().count(), 1);

        let without = it.to_element("ns", false);
        assert_eq!(without.children().count(), 0);
    }
}
