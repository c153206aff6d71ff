//! Persistence backend contract.
//!
//! The engine consumes CRUD primitives for nodes, affiliations,
//! subscriptions, and items; it never defines a schema. Item writes go
//! through the batcher, everything else is called inline from the
//! request path after the reply is decided.

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use thiserror::Error;

use crate::item::PublishedItem;
use crate::node::Node;
use crate::subscription::NodeSubscription;
use crate::types::Affiliation;

/// Failure reported by a persistence backend.
#[derive(Debug, Clone, Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    /// Create a storage error from any displayable cause.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Storage primitives consumed by the engine.
///
/// `create_published_item` must be idempotent on `(node, item id)`:
/// writing the same identity twice replaces rather than duplicates.
/// The boolean item operations report success; the batcher retries
/// failures forever.
#[async_trait]
pub trait PersistenceBackend: Send + Sync + 'static {
    /// Load every persisted node at service start.
    async fn load_nodes(&self) -> Result<Vec<Node>, StorageError>;

    /// Create or update a node record.
    async fn save_node(&self, node: &Node) -> Result<(), StorageError>;

    /// Delete a node and everything hanging off it.
    async fn delete_node(&self, node_id: &str) -> Result<(), StorageError>;

    /// Durably write one published item. Returns false on failure.
    async fn create_published_item(&self, item: &PublishedItem) -> bool;

    /// Remove one published item. Returns false on failure.
    async fn remove_published_item(&self, item: &PublishedItem) -> bool;

    /// Create or update a subscription record.
    async fn save_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), StorageError>;

    /// Delete a subscription record.
    async fn delete_subscription(&self, node_id: &str, sub_id: &str) -> Result<(), StorageError>;

    /// Create or update an affiliation record.
    async fn save_affiliation(
        &self,
        node_id: &str,
        jid: &BareJid,
        affiliation: Affiliation,
    ) -> Result<(), StorageError>;

    /// Delete an affiliation record.
    async fn delete_affiliation(&self, node_id: &str, jid: &BareJid) -> Result<(), StorageError>;
}

/// In-memory backend.
///
/// Uses DashMap for thread-safe concurrent access. Suitable for tests
/// and volatile deployments; a real deployment plugs in a database
/// implementation.
#[derive(Default)]
pub struct InMemoryBackend {
    nodes: DashMap<String, Node>,
    /// Map of (node id, item id) -> item
    items: DashMap<(String, String), PublishedItem>,
    /// When set, item writes report failure (for retry tests).
    item_writes_fail: std::sync::atomic::AtomicBool,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failure injection for item writes.
    pub fn set_item_writes_fail(&self, fail: bool) {
        self.item_writes_fail
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.item_writes_fail
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of stored items for a node.
    pub fn stored_item_count(&self, node_id: &str) -> usize {
        self.items
            .iter()
            .filter(|entry| entry.key().0 == node_id)
            .count()
    }

    /// Ids of stored items for a node.
    pub fn stored_item_ids(&self, node_id: &str) -> Vec<String> {
        self.items
            .iter()
            .filter(|entry| entry.key().0 == node_id)
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    /// Whether a node record exists.
    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn load_nodes(&self) -> Result<Vec<Node>, StorageError> {
        Ok(self.nodes.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn save_node(&self, node: &Node) -> Result<(), StorageError> {
        self.nodes.insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<(), StorageError> {
        self.nodes.remove(node_id);
        self.items.retain(|key, _| key.0 != node_id);
        Ok(())
    }

    async fn create_published_item(&self, item: &PublishedItem) -> bool {
        if self.failing() {
            return false;
        }
        self.items
            .insert((item.node_id.clone(), item.id.clone()), item.clone());
        true
    }

    async fn remove_published_item(&self, item: &PublishedItem) -> bool {
        if self.failing() {
            return false;
        }
        self.items.remove(&(item.node_id.clone(), item.id.clone()));
        true
    }

    async fn save_subscription(
        &self,
        node_id: &str,
        subscription: &NodeSubscription,
    ) -> Result<(), StorageError> {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            let sub = subscription.clone();
            node.update_subscription(&sub.id.clone(), move |s| *s = sub);
        }
        Ok(())
    }

    async fn delete_subscription(&self, node_id: &str, sub_id: &str) -> Result<(), StorageError> {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.remove_subscription(sub_id);
        }
        Ok(())
    }

    async fn save_affiliation(
        &self,
        node_id: &str,
        jid: &BareJid,
        affiliation: Affiliation,
    ) -> Result<(), StorageError> {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            let _ = node.set_affiliation(jid.clone(), affiliation);
        }
        Ok(())
    }

    async fn delete_affiliation(&self, node_id: &str, jid: &BareJid) -> Result<(), StorageError> {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            let _ = node.set_affiliation(jid.clone(), Affiliation::None);
        }
        Ok(())
    }
}
