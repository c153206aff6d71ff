//! Service configuration and the context of outer-server collaborators.
//!
//! The engine takes no global state: everything it consumes from the
//! outer server (router, persistence, user registry, command manager)
//! arrives here at construction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jid::BareJid;

use crate::backend::PersistenceBackend;
use crate::commands::AdHocCommandManager;
use crate::router::StanzaRouter;

/// User registry lookup consumed by the engine.
///
/// Anonymous (unregistered) entities may neither create nodes nor
/// subscribe.
pub trait UserRegistry: Send + Sync + 'static {
    /// Whether the bare JID names a registered user.
    fn is_registered(&self, jid: &BareJid) -> bool;
}

/// Registry that accepts everyone. Handy for tests and open services.
#[derive(Debug, Default)]
pub struct OpenUserRegistry;

impl UserRegistry for OpenUserRegistry {
    fn is_registered(&self, _jid: &BareJid) -> bool {
        true
    }
}

/// Service-wide policy and identity.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address of the PubSub service.
    pub service_jid: BareJid,
    /// Whether collection nodes (and the root collection) exist.
    pub collections_supported: bool,
    /// Whether create requests without a node id get a generated one.
    pub instant_nodes_supported: bool,
    /// JIDs that bypass every permission check.
    pub admins: HashSet<BareJid>,
    /// Persistence flush period.
    pub flush_period: Duration,
    /// Max queue entries written per flush, per queue.
    pub flush_batch_size: usize,
}

impl ServiceConfig {
    /// Create a configuration with service defaults.
    pub fn new(service_jid: BareJid) -> Self {
        Self {
            service_jid,
            collections_supported: true,
            instant_nodes_supported: true,
            admins: HashSet::new(),
            flush_period: Duration::from_secs(120),
            flush_batch_size: 50,
        }
    }

    /// Toggle collection node support.
    pub fn with_collections(mut self, supported: bool) -> Self {
        self.collections_supported = supported;
        self
    }

    /// Toggle instant node support.
    pub fn with_instant_nodes(mut self, supported: bool) -> Self {
        self.instant_nodes_supported = supported;
        self
    }

    /// Designate a service admin.
    pub fn with_admin(mut self, admin: BareJid) -> Self {
        self.admins.insert(admin);
        self
    }

    /// Override the persistence flush period.
    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    /// Override the persistence batch size.
    pub fn with_flush_batch_size(mut self, batch_size: usize) -> Self {
        self.flush_batch_size = batch_size;
        self
    }
}

/// Everything the engine consumes from the outer server.
pub struct ServiceContext {
    /// Service policy and identity.
    pub config: ServiceConfig,
    /// Outbound stanza sink.
    pub router: Arc<dyn StanzaRouter>,
    /// Persistence primitives.
    pub backend: Arc<dyn PersistenceBackend>,
    /// User registry.
    pub users: Arc<dyn UserRegistry>,
    /// Ad-hoc command manager, when the deployment wires one.
    pub commands: Option<Arc<dyn AdHocCommandManager>>,
}

impl ServiceContext {
    /// Whether the bare JID is a service admin.
    pub fn is_admin(&self, jid: &BareJid) -> bool {
        self.config.admins.contains(jid)
    }

    /// Whether the bare JID may create nodes.
    pub fn can_create_node(&self, jid: &BareJid) -> bool {
        self.is_admin(jid) || self.users.is_registered(jid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::router::ChannelRouter;

    #[test]
    fn test_config_builders() {
        let service: BareJid = "pubsub.rookery.chat".parse().unwrap();
        let admin: BareJid = "admin@rookery.chat".parse().unwrap();

        let config = ServiceConfig::new(service)
            .with_collections(false)
            .with_instant_nodes(false)
            .with_admin(admin.clone())
            .with_flush_period(Duration::from_secs(5))
            .with_flush_batch_size(10);

        assert!(!config.collections_supported);
        assert!(!config.instant_nodes_supported);
        assert!(config.admins.contains(&admin));
        assert_eq!(config.flush_batch_size, 10);
    }

    #[test]
    fn test_admin_can_create_without_registration() {
        struct NobodyRegistry;
        impl UserRegistry for NobodyRegistry {
            fn is_registered(&self, _jid: &BareJid) -> bool {
                false
            }
        }

        let service: BareJid = "pubsub.rookery.chat".parse().unwrap();
        let admin: BareJid = "admin@rookery.chat".parse().unwrap();
        let (router, _rx) = ChannelRouter::new(4);

        let ctx = ServiceContext {
            config: ServiceConfig::new(service).with_admin(admin.clone()),
            router,
            backend: Arc::new(InMemoryBackend::new()),
            users: Arc::new(NobodyRegistry),
            commands: None,
        };

        assert!(ctx.can_create_node(&admin));
        assert!(!ctx.can_create_node(&"user@rookery.chat".parse().unwrap()));
    }
}
