//! Stanza types and reply builders.
//!
//! Namespaces and the small set of IQ reply helpers shared by every
//! handler. Payload construction uses minidom elements throughout;
//! parsed stanza types come from xmpp-parsers.

use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// Ad-hoc commands namespace (XEP-0050).
pub const NS_COMMANDS: &str = "http://jabber.org/protocol/commands";

/// Data forms namespace (XEP-0004).
pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// An outbound stanza handed to the router.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// Info/query stanza
    Iq(Iq),
    /// Message stanza
    Message(Message),
    /// Presence stanza
    Presence(Presence),
}

/// Build an IQ result reply, optionally carrying a payload element.
pub fn result_iq(request: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Result(payload),
    }
}

/// Wrap a payload in a `<pubsub/>` envelope in the main namespace.
pub fn pubsub_envelope(child: Element) -> Element {
    Element::builder("pubsub", NS_PUBSUB).append(child).build()
}

/// Wrap a payload in a `<pubsub/>` envelope in the owner namespace.
pub fn pubsub_owner_envelope(child: Element) -> Element {
    Element::builder("pubsub", NS_PUBSUB_OWNER)
        .append(child)
        .build()
}
