//! Node store: the in-memory forest of nodes.
//!
//! A concurrent map of node id to node, with per-id serialization of
//! inserts so concurrent create requests produce exactly one winner.
//! Each node sits behind its own lock; the store never holds a node
//! lock itself.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::BareJid;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{DefaultConfigs, NodeConfig};
use crate::node::{Node, NodeId};

/// Node id of the root collection.
pub const ROOT_NODE_ID: &str = "";

/// Registry of all nodes in the service.
///
/// Uses DashMap so lookups and inserts are lock-free for callers; the
/// map's internal sharding doubles as the striped per-id mutex that
/// serializes create races.
pub struct NodeStore {
    nodes: DashMap<NodeId, Arc<RwLock<Node>>>,
    root: Option<NodeId>,
    /// Default configuration per node kind, applied at creation.
    pub defaults: DefaultConfigs,
}

impl NodeStore {
    /// Create a store, with a root collection when collections are
    /// supported. The service JID owns the root.
    pub fn new(collections_supported: bool, service_jid: &BareJid) -> Self {
        let store = Self {
            nodes: DashMap::new(),
            root: collections_supported.then(|| ROOT_NODE_ID.to_string()),
            defaults: DefaultConfigs::default(),
        };

        if store.root.is_some() {
            let root = Node::new_collection(
                ROOT_NODE_ID.to_string(),
                None,
                service_jid.clone(),
                NodeConfig::collection_default(),
            );
            store
                .nodes
                .insert(ROOT_NODE_ID.to_string(), Arc::new(RwLock::new(root)));
            info!(service = %service_jid, "Node store created with root collection");
        }

        store
    }

    /// The root collection's node id, when collections are supported.
    pub fn root_id(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Whether the id names the root collection.
    pub fn is_root(&self, node_id: &str) -> bool {
        self.root.as_deref() == Some(node_id)
    }

    /// Look up a node.
    pub fn get(&self, node_id: &str) -> Option<Arc<RwLock<Node>>> {
        self.nodes.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a node with this id exists.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Insert a freshly created node.
    ///
    /// The check-and-insert is atomic per id: when two creates race,
    /// exactly one gets the node back, the other gets None.
    pub fn insert_new(&self, node: Node) -> Option<Arc<RwLock<Node>>> {
        let node_id = node.node_id.clone();
        match self.nodes.entry(node_id.clone()) {
            Entry::Occupied(_) => {
                debug!(node = %node_id, "Create lost the insert race");
                None
            }
            Entry::Vacant(vacant) => {
                let arc = Arc::new(RwLock::new(node));
                vacant.insert(Arc::clone(&arc));
                debug!(node = %node_id, "Node inserted");
                Some(arc)
            }
        }
    }

    /// Re-insert a node loaded from storage, replacing any previous entry.
    pub fn insert_loaded(&self, node: Node) {
        let node_id = node.node_id.clone();
        self.nodes.insert(node_id, Arc::new(RwLock::new(node)));
    }

    /// Remove a node from the store.
    pub fn remove(&self, node_id: &str) -> Option<Arc<RwLock<Node>>> {
        self.nodes.remove(node_id).map(|(_, node)| node)
    }

    /// Snapshot of every node handle (iteration without holding the map).
    pub fn all(&self) -> Vec<Arc<RwLock<Node>>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
