//! Stanza router contract.
//!
//! The outer server supplies the router; the engine only ever calls
//! `route`, which must not block. Delivery is best-effort: failures
//! come back as inbound error stanzas, never as return values.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stanza::Stanza;

/// Non-blocking outbound stanza sink.
pub trait StanzaRouter: Send + Sync + 'static {
    /// Hand a stanza to the outer server for delivery.
    fn route(&self, stanza: Stanza);
}

/// Router that queues stanzas onto a bounded channel.
///
/// Useful for embedding and for tests; the receiving side is the outer
/// server's delivery loop. A full channel drops the stanza, matching
/// the best-effort contract.
pub struct ChannelRouter {
    sender: mpsc::Sender<Stanza>,
}

impl ChannelRouter {
    /// Create a router and its receiving end.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Stanza>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Arc::new(Self { sender }), receiver)
    }
}

impl StanzaRouter for ChannelRouter {
    fn route(&self, stanza: Stanza) {
        match self.sender.try_send(stanza) {
            Ok(()) => debug!("Stanza queued for delivery"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Router channel full, stanza dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Router channel closed, stanza dropped");
            }
        }
    }
}
