//! Shared harness for engine integration tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use jid::BareJid;
use minidom::Element;
use rookery_pubsub::{
    InMemoryBackend, PubSubService, ServiceConfig, ServiceContext, Stanza, StanzaRouter,
    UserRegistry,
};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;
use xmpp_parsers::stanza_error::DefinedCondition;

/// Router that records every stanza the engine emits.
#[derive(Default)]
pub struct RecordingRouter {
    stanzas: Mutex<Vec<Stanza>>,
}

impl RecordingRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<Stanza> {
        std::mem::take(&mut self.stanzas.lock().unwrap())
    }

    /// Drain only the recorded messages, keeping other stanzas queued.
    pub fn take_messages(&self) -> Vec<Message> {
        let mut stanzas = self.stanzas.lock().unwrap();
        let mut messages = Vec::new();
        let mut rest = Vec::new();
        for stanza in std::mem::take(&mut *stanzas) {
            match stanza {
                Stanza::Message(m) => messages.push(m),
                other => rest.push(other),
            }
        }
        *stanzas = rest;
        messages
    }

    /// Drain only the recorded IQs, keeping other stanzas queued.
    pub fn take_iqs(&self) -> Vec<Iq> {
        let mut stanzas = self.stanzas.lock().unwrap();
        let mut iqs = Vec::new();
        let mut rest = Vec::new();
        for stanza in std::mem::take(&mut *stanzas) {
            match stanza {
                Stanza::Iq(iq) => iqs.push(iq),
                other => rest.push(other),
            }
        }
        *stanzas = rest;
        iqs
    }

    /// Drain only the recorded presences, keeping other stanzas queued.
    pub fn take_presences(&self) -> Vec<Presence> {
        let mut stanzas = self.stanzas.lock().unwrap();
        let mut presences = Vec::new();
        let mut rest = Vec::new();
        for stanza in std::mem::take(&mut *stanzas) {
            match stanza {
                Stanza::Presence(p) => presences.push(p),
                other => rest.push(other),
            }
        }
        *stanzas = rest;
        presences
    }
}

impl StanzaRouter for RecordingRouter {
    fn route(&self, stanza: Stanza) {
        self.stanzas.lock().unwrap().push(stanza);
    }
}

/// Registry admitting a fixed set of local users.
pub struct FixedRegistry {
    registered: HashSet<BareJid>,
}

impl FixedRegistry {
    pub fn new(users: &[&str]) -> Self {
        Self {
            registered: users.iter().map(|u| u.parse().unwrap()).collect(),
        }
    }
}

impl UserRegistry for FixedRegistry {
    fn is_registered(&self, jid: &BareJid) -> bool {
        self.registered.contains(jid)
    }
}

pub const SERVICE: &str = "pubsub.rookery.chat";

/// Engine plus its recorded surroundings.
pub struct Harness {
    pub service: PubSubService,
    pub router: Arc<RecordingRouter>,
    pub backend: Arc<InMemoryBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::new(SERVICE.parse().unwrap()))
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let router = RecordingRouter::new();
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = ServiceContext {
            config,
            router: router.clone(),
            backend: backend.clone(),
            users: Arc::new(FixedRegistry::new(&[
                "alice@rookery.chat",
                "bob@rookery.chat",
                "carol@rookery.chat",
                "mallory@rookery.chat",
            ])),
            commands: None,
        };
        Self {
            service: PubSubService::new(ctx),
            router,
            backend,
        }
    }

    /// Feed an IQ built from raw XML and return the engine's reply.
    pub async fn request(&self, xml: &str) -> Iq {
        let elem: Element = xml.parse().expect("valid XML");
        let iq = Iq::try_from(elem).expect("valid IQ");
        assert!(self.service.process_iq(&iq).await, "IQ should be handled");
        let mut iqs = self.router.take_iqs();
        assert_eq!(iqs.len(), 1, "exactly one reply expected");
        iqs.remove(0)
    }

    /// Feed a presence stanza built from raw XML.
    pub fn presence(&self, xml: &str) {
        let elem: Element = xml.parse().expect("valid XML");
        let presence = Presence::try_from(elem).expect("valid presence");
        self.service.process_presence(&presence);
    }

    /// Feed a message stanza built from raw XML.
    pub async fn message(&self, xml: &str) {
        let elem: Element = xml.parse().expect("valid XML");
        let message = Message::try_from(elem).expect("valid message");
        self.service.process_message(&message).await;
    }
}

/// Assert a reply is a result, returning its payload.
pub fn expect_result(iq: &Iq) -> Option<Element> {
    match &iq.payload {
        IqType::Result(payload) => payload.clone(),
        other => panic!("Expected result, got {:?}", other),
    }
}

/// Assert a reply is an error with the given base condition; returns
/// the application condition element name, if any.
pub fn expect_error(iq: &Iq, condition: DefinedCondition) -> Option<String> {
    match &iq.payload {
        IqType::Error(error) => {
            assert_eq!(error.defined_condition, condition, "base condition");
            error.other.as_ref().map(|e| e.name().to_string())
        }
        other => panic!("Expected error, got {:?}", other),
    }
}

/// First value of a field in a submitted/blank data form element.
pub fn form_field(form: &Element, var: &str) -> Option<String> {
    form.children()
        .filter(|c| c.name() == "field")
        .find(|c| c.attr("var") == Some(var))
        .and_then(|f| f.children().find(|c| c.name() == "value"))
        .map(|v| v.text())
}
