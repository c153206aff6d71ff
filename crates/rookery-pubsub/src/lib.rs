//! # rookery-pubsub
//!
//! Embeddable XMPP Publish-Subscribe (XEP-0060) engine.
//!
//! The engine is a protocol state machine: the outer server feeds it
//! IQ, Presence, and Message stanzas addressed to the PubSub service
//! address, and it maintains a forest of topic nodes, dispatches
//! requests against them, and fans event notifications out through the
//! server's stanza router.
//!
//! ## Architecture
//!
//! - **Service**: one [`PubSubService`] per service address, driving
//!   dispatch and the node store
//! - **Nodes**: leaves hold a bounded item history, collections hold
//!   children; each node sits behind its own lock
//! - **Batcher**: durable item writes go through a background worker
//!   that flushes add/delete queues on a ticker and retries failures
//! - **Presence tracker**: per-bare-JID resource map gating delivery
//!   on presence-based nodes and subscriptions
//!
//! Everything the engine needs from the outer server arrives through
//! [`ServiceContext`]: a non-blocking stanza router, the persistence
//! backend, the user registry, and (optionally) an ad-hoc command
//! manager for the XEP-0050 namespace.
//!
//! ## XML Namespaces
//!
//! - `http://jabber.org/protocol/pubsub` - requests and replies
//! - `http://jabber.org/protocol/pubsub#owner` - node management
//! - `http://jabber.org/protocol/pubsub#event` - event notifications
//! - `http://jabber.org/protocol/pubsub#errors` - error conditions
//! - `http://jabber.org/protocol/commands` - forwarded ad-hoc commands

pub mod affiliate;
pub mod backend;
pub mod batcher;
pub mod commands;
pub mod config;
pub mod context;
pub mod forms;
pub mod item;
pub mod node;
pub mod presence;
pub mod router;
pub mod service;
pub mod stanza;
pub mod store;
pub mod subscription;

mod error;
mod types;

pub use backend::{InMemoryBackend, PersistenceBackend, StorageError};
pub use commands::AdHocCommandManager;
pub use context::{OpenUserRegistry, ServiceConfig, ServiceContext, UserRegistry};
pub use error::{PubSubCondition, PubSubError, NS_PUBSUB_ERRORS};
pub use router::{ChannelRouter, StanzaRouter};
pub use service::PubSubService;
pub use stanza::{Stanza, NS_COMMANDS, NS_DATA_FORMS, NS_PUBSUB, NS_PUBSUB_EVENT, NS_PUBSUB_OWNER};
pub use types::*;
