//! Background persistence batcher.
//!
//! Two FIFO queues of pending item writes, drained by a single worker
//! on a ticker. A failed write goes back to the tail of its queue and
//! is retried on a later flush, forever; persistence failures never
//! surface to a requester. Shutdown cancels the ticker and drains both
//! queues once, best-effort.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::PersistenceBackend;
use crate::item::PublishedItem;

/// Queued item writes, drained oldest first.
///
/// The linear cancellation scan is fine: the queue holds at most a few
/// flush periods worth of publishes.
#[derive(Debug, Default)]
struct FlushQueue {
    entries: VecDeque<PublishedItem>,
}

impl FlushQueue {
    fn push(&mut self, item: PublishedItem) {
        self.entries.push_back(item);
    }

    fn drain_batch(&mut self, max: usize) -> Vec<PublishedItem> {
        let take = self.entries.len().min(max);
        self.entries.drain(..take).collect()
    }

    fn drain_all(&mut self) -> Vec<PublishedItem> {
        self.entries.drain(..).collect()
    }

    /// Remove every entry with the given identity; true when any was present.
    fn cancel(&mut self, node_id: &str, item_id: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|i| !(i.node_id == node_id && i.id == item_id));
        self.entries.len() < before
    }

    fn cancel_node(&mut self, node_id: &str) {
        self.entries.retain(|i| i.node_id != node_id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Batching writer for published items.
pub struct PersistenceBatcher {
    backend: Arc<dyn PersistenceBackend>,
    to_add: Mutex<FlushQueue>,
    to_delete: Mutex<FlushQueue>,
    batch_size: usize,
}

/// Take a queue lock, recovering from poisoning: a panicked flush must
/// not wedge the queues forever.
fn lock(queue: &Mutex<FlushQueue>) -> MutexGuard<'_, FlushQueue> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PersistenceBatcher {
    /// Create a batcher over the given backend.
    pub fn new(backend: Arc<dyn PersistenceBackend>, batch_size: usize) -> Self {
        Self {
            backend,
            to_add: Mutex::new(FlushQueue::default()),
            to_delete: Mutex::new(FlushQueue::default()),
            batch_size,
        }
    }

    /// Queue a durable write for a published item.
    pub fn queue_item_to_add(&self, item: PublishedItem) {
        lock(&self.to_add).push(item);
    }

    /// Queue removal of a published item.
    ///
    /// When the matching add is still queued, the write has not reached
    /// storage yet, so cancelling it is the whole job.
    pub fn queue_item_to_remove(&self, item: PublishedItem) {
        let cancelled = lock(&self.to_add).cancel(&item.node_id, &item.id);
        if !cancelled {
            lock(&self.to_delete).push(item);
        }
    }

    /// Drop every queued operation for a node (node delete, purge).
    pub fn cancel_queued_items(&self, node_id: &str) {
        lock(&self.to_add).cancel_node(node_id);
        lock(&self.to_delete).cancel_node(node_id);
    }

    /// Number of queued adds.
    pub fn pending_add_count(&self) -> usize {
        lock(&self.to_add).len()
    }

    /// Number of queued deletes.
    pub fn pending_delete_count(&self) -> usize {
        lock(&self.to_delete).len()
    }

    /// Drain one batch from each queue, re-queueing failures.
    pub async fn flush_once(&self) {
        let adds = lock(&self.to_add).drain_batch(self.batch_size);
        let mut failed_adds = Vec::new();
        for item in adds {
            if !self.backend.create_published_item(&item).await {
                warn!(node = %item.node_id, item = %item.id, "Item write failed, re-queueing");
                failed_adds.push(item);
            }
        }
        if !failed_adds.is_empty() {
            let mut queue = lock(&self.to_add);
            for item in failed_adds {
                queue.push(item);
            }
        }

        let deletes = lock(&self.to_delete).drain_batch(self.batch_size);
        let mut failed_deletes = Vec::new();
        for item in deletes {
            if !self.backend.remove_published_item(&item).await {
                warn!(node = %item.node_id, item = %item.id, "Item removal failed, re-queueing");
                failed_deletes.push(item);
            }
        }
        if !failed_deletes.is_empty() {
            let mut queue = lock(&self.to_delete);
            for item in failed_deletes {
                queue.push(item);
            }
        }
    }

    /// Drain everything once without retry. Used at shutdown.
    pub async fn drain_all(&self) {
        let adds = lock(&self.to_add).drain_all();
        let deletes = lock(&self.to_delete).drain_all();
        debug!(
            adds = adds.len(),
            deletes = deletes.len(),
            "Draining persistence queues"
        );
        for item in adds {
            if !self.backend.create_published_item(&item).await {
                warn!(node = %item.node_id, item = %item.id, "Item write dropped at shutdown");
            }
        }
        for item in deletes {
            if !self.backend.remove_published_item(&item).await {
                warn!(node = %item.node_id, item = %item.id, "Item removal dropped at shutdown");
            }
        }
    }

    /// Spawn the periodic flush worker.
    ///
    /// Cancelling the token stops the ticker, drains both queues once,
    /// and lets the task exit.
    pub fn spawn(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; swallow it.
            ticker.tick().await;
            info!(period_secs = period.as_secs(), "Persistence batcher started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        batcher.drain_all().await;
                        info!("Persistence batcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        batcher.flush_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    fn item(node: &str, id: &str) -> PublishedItem {
        PublishedItem::new(
            node.to_string(),
            id.to_string(),
            "alice@rookery.chat".parse().unwrap(),
            None,
        )
    }

    fn batcher(backend: &Arc<InMemoryBackend>) -> PersistenceBatcher {
        PersistenceBatcher::new(
            Arc::clone(backend) as Arc<dyn PersistenceBackend>,
            50,
        )
    }

    #[tokio::test]
    async fn test_flush_writes_queued_adds() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = batcher(&backend);

        batcher.queue_item_to_add(item("/blog", "i1"));
        batcher.queue_item_to_add(item("/blog", "i2"));
        assert_eq!(batcher.pending_add_count(), 2);

        batcher.flush_once().await;
        assert_eq!(batcher.pending_add_count(), 0);
        assert_eq!(backend.stored_item_count("/blog"), 2);
    }

    #[tokio::test]
    async fn test_remove_cancels_pending_add() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = batcher(&backend);

        batcher.queue_item_to_add(item("/blog", "i1"));
        batcher.queue_item_to_remove(item("/blog", "i1"));
        assert_eq!(batcher.pending_add_count(), 0);
        assert_eq!(batcher.pending_delete_count(), 0);

        batcher.flush_once().await;
        assert_eq!(backend.stored_item_count("/blog"), 0);
    }

    #[tokio::test]
    async fn test_remove_of_stored_item_queues_delete() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = batcher(&backend);

        batcher.queue_item_to_add(item("/blog", "i1"));
        batcher.flush_once().await;
        assert_eq!(backend.stored_item_count("/blog"), 1);

        batcher.queue_item_to_remove(item("/blog", "i1"));
        assert_eq!(batcher.pending_delete_count(), 1);
        batcher.flush_once().await;
        assert_eq!(backend.stored_item_count("/blog"), 0);
    }

    #[tokio::test]
    async fn test_failed_write_requeued_and_retried() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = batcher(&backend);

        backend.set_item_writes_fail(true);
        batcher.queue_item_to_add(item("/blog", "i1"));
        batcher.flush_once().await;
        assert_eq!(batcher.pending_add_count(), 1, "failure re-queued");
        assert_eq!(backend.stored_item_count("/blog"), 0);

        backend.set_item_writes_fail(false);
        batcher.flush_once().await;
        assert_eq!(batcher.pending_add_count(), 0);
        assert_eq!(backend.stored_item_count("/blog"), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_items_clears_both_queues() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = batcher(&backend);

        batcher.queue_item_to_add(item("/blog", "i1"));
        batcher.queue_item_to_add(item("/other", "i2"));
        batcher.queue_item_to_remove(item("/blog", "stored"));

        batcher.cancel_queued_items("/blog");
        assert_eq!(batcher.pending_add_count(), 1);
        assert_eq!(batcher.pending_delete_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_size_limits_single_flush() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = PersistenceBatcher::new(
            Arc::clone(&backend) as Arc<dyn PersistenceBackend>,
            2,
        );

        for i in 0..5 {
            batcher.queue_item_to_add(item("/blog", &format!("i{}", i)));
        }
        batcher.flush_once().await;
        assert_eq!(batcher.pending_add_count(), 3);
        assert_eq!(backend.stored_item_count("/blog"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queues() {
        let backend = Arc::new(InMemoryBackend::new());
        let batcher = Arc::new(batcher(&backend));

        let token = CancellationToken::new();
        let handle = batcher.spawn(Duration::from_secs(3600), token.clone());

        batcher.queue_item_to_add(item("/blog", "i1"));
        token.cancel();
        handle.await.expect("worker exits");

        assert_eq!(batcher.pending_add_count(), 0);
        assert_eq!(backend.stored_item_count("/blog"), 1);
    }
}
