//! Ad-hoc command bridge (XEP-0050).
//!
//! The engine does not implement command semantics; it recognizes the
//! commands namespace during IQ dispatch and forwards the stanza to an
//! external manager, routing whatever reply the manager produces.

use async_trait::async_trait;
use xmpp_parsers::iq::Iq;

/// External ad-hoc command processor.
#[async_trait]
pub trait AdHocCommandManager: Send + Sync + 'static {
    /// Process a command IQ, returning the reply to route, if any.
    async fn process_command(&self, iq: &Iq) -> Option<Iq>;

    /// Tear down command session state at service shutdown.
    fn stop(&self) {}
}
