//! Write-back persistence engine for published items.
//!
//! Saves and removals update the item cache and land in the pending queues;
//! [`PubSubPersistence::flush_pending_items`] moves them to the backend in
//! one batch. Reads are served from the cache first, then from the pending
//! queues, and only then from the backend.
//!
//! Lock order: cache-wide lock, then `flush_lock`, then `pending`. The
//! `pending` mutex is never held across an await point.

use std::sync::Arc;

use aerie_core::{ClockSource, ClusterTask, ItemKey, LeafNode, PublishedItem, SystemClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::pending::PendingQueues;
use super::timers::PubSubTimers;
use crate::cluster::{ClusterMessenger, ClusterTaskHandler, StandaloneCluster};
use crate::config::PubSubConfig;
use crate::error::PersistenceError;
use crate::storage::{ItemCache, LocalItemCache, PubSubStore};

/// Cache-fronted, batch-flushing store of published items.
///
/// Shared as `Arc<PubSubPersistence>`; the periodic timers hold only a weak
/// reference to it.
pub struct PubSubPersistence {
    store: Arc<dyn PubSubStore>,
    cache: Arc<dyn ItemCache>,
    cluster: Arc<dyn ClusterMessenger>,
    clock: Arc<dyn ClockSource>,
    config: PubSubConfig,
    pending: Mutex<PendingQueues>,
    flush_lock: tokio::sync::Mutex<()>,
    timers: PubSubTimers,
}

impl PubSubPersistence {
    /// Creates an engine over `store` with a local cache, no cluster, and the
    /// system clock.
    #[must_use]
    pub fn new(store: Arc<dyn PubSubStore>, config: PubSubConfig) -> Self {
        Self {
            store,
            cache: Arc::new(LocalItemCache::new()),
            cluster: Arc::new(StandaloneCluster),
            clock: Arc::new(SystemClock),
            config,
            pending: Mutex::new(PendingQueues::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            timers: PubSubTimers::new(),
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ItemCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterMessenger>) -> Self {
        self.cluster = cluster;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn ItemCache> {
        &self.cache
    }

    /// Number of items waiting to be inserted.
    #[must_use]
    pub fn pending_insert_count(&self) -> usize {
        self.pending.lock().insert_count()
    }

    /// Number of keys waiting to be deleted.
    #[must_use]
    pub fn pending_delete_count(&self) -> usize {
        self.pending.lock().delete_count()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Caches `item` and queues it for insertion.
    ///
    /// A still-pending insert for the same key is superseded: its insert is
    /// cancelled and a delete of the key is queued ahead of the new insert.
    /// When the pending inserts exceed `max_items_flush` the queues are
    /// flushed before returning; a failed flush is logged, not returned.
    pub async fn save_published_item(&self, item: PublishedItem) {
        let node_id = item.node_id.clone();
        let item_id = item.item_id.clone();

        let (superseded, pending) = {
            let mut pending = self.pending.lock();
            let superseded = pending.enqueue_save(item.clone());
            self.cache.put(item);
            (superseded, pending.insert_count())
        };
        debug!(node = %node_id, item = %item_id, superseded, pending, "queued item for insert");

        if pending > self.config.max_items_flush {
            debug!(
                pending,
                max = self.config.max_items_flush,
                "pending inserts over limit, flushing"
            );
            if let Err(e) = self.flush_pending_items().await {
                warn!(node = %node_id, error = %e, "flush triggered by save failed");
            }
        }
    }

    /// Evicts `item` from the cache and queues its deletion.
    ///
    /// A pending insert of the same key is cancelled.
    pub fn remove_published_item(&self, item: &PublishedItem) {
        let key = item.key();
        let cancelled = {
            let mut pending = self.pending.lock();
            let cancelled = pending.enqueue_remove(key.clone());
            self.cache.remove(&key);
            cancelled
        };
        debug!(item = %key, cancelled, "queued item for delete");
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Returns the item `item_id` of `node`, or `None` if it does not exist.
    ///
    /// Cache hits take no lock. On a miss the cache-wide lock is held while
    /// the pending queues and then the backend are consulted, so concurrent
    /// misses for the same key load it once.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the backend read fails.
    pub async fn get_published_item(
        &self,
        node: &LeafNode,
        item_id: &str,
    ) -> Result<Option<PublishedItem>, PersistenceError> {
        let key = node.item_key(item_id);
        if let Some(item) = self.cache.get(&key) {
            return Ok(Some(item));
        }

        let _guard = self.cache.lock().await;
        if let Some(item) = self.cache.get(&key) {
            return Ok(Some(item));
        }

        let generation = {
            let pending = self.pending.lock();
            match pending.lookup(&key) {
                Some(Some(item)) => {
                    let item = item.clone();
                    self.cache.put(item.clone());
                    return Ok(Some(item));
                }
                Some(None) => return Ok(None),
                None => pending.generation(),
            }
        };

        let loaded = self.store.load_item(node, item_id).await.map_err(|e| {
            error!(item = %key, error = %e, "failed to load published item");
            PersistenceError::from(e)
        })?;

        // A save, remove, or flush may have happened while the backend was read.
        Ok(self.settle_loaded(&key, loaded, generation))
    }

    fn settle_loaded(
        &self,
        key: &ItemKey,
        loaded: Option<PublishedItem>,
        generation: u64,
    ) -> Option<PublishedItem> {
        let pending = self.pending.lock();
        match pending.lookup(key) {
            Some(Some(item)) => {
                self.cache.put(item.clone());
                Some(item.clone())
            }
            Some(None) => None,
            // The row may predate a batch that finished during the read.
            None if pending.generation() != generation => loaded,
            None => {
                if let Some(item) = &loaded {
                    self.cache.put(item.clone());
                }
                loaded
            }
        }
    }

    /// Returns the stored items of `node`, oldest first.
    ///
    /// At most the node's `max_published_items` rows are returned, and never
    /// more than `max_rows_fetch`. Pending writes are not included.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the backend read fails.
    pub async fn get_published_items(
        &self,
        node: &LeafNode,
    ) -> Result<Vec<PublishedItem>, PersistenceError> {
        let max_rows = node
            .max_published_items
            .unwrap_or(self.config.max_rows_fetch);
        self.get_published_items_with_limit(node, max_rows).await
    }

    /// Returns at most `max_rows` stored items of `node`, oldest first.
    ///
    /// `max_rows` is capped at `max_rows_fetch`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the backend read fails.
    pub async fn get_published_items_with_limit(
        &self,
        node: &LeafNode,
        max_rows: usize,
    ) -> Result<Vec<PublishedItem>, PersistenceError> {
        let max_rows = max_rows.min(self.config.max_rows_fetch);
        if max_rows == 0 {
            return Ok(Vec::new());
        }
        self.store.load_items(node, max_rows).await.map_err(|e| {
            error!(node = %node.node_id, error = %e, "failed to load published items");
            PersistenceError::from(e)
        })
    }

    /// Returns the newest item of `node`, pending or stored.
    ///
    /// When a pending and a stored item share a creation date the pending one
    /// wins.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the backend read fails.
    pub async fn get_last_published_item(
        &self,
        node: &LeafNode,
    ) -> Result<Option<PublishedItem>, PersistenceError> {
        let pending = self.pending.lock().newest_for_node(&node.node_id).cloned();

        let stored = self
            .store
            .load_items(node, 1)
            .await
            .map_err(|e| {
                error!(node = %node.node_id, error = %e, "failed to load last published item");
                PersistenceError::from(e)
            })?
            .pop();
        let stored = stored.filter(|item| self.pending.lock().lookup(&item.key()).is_none());

        Ok(match (pending, stored) {
            (Some(pending), Some(stored)) if stored.creation_date > pending.creation_date => {
                Some(stored)
            }
            (Some(pending), _) => Some(pending),
            (None, stored) => stored,
        })
    }

    // -----------------------------------------------------------------------
    // Flush and purge
    // -----------------------------------------------------------------------

    /// Flushes this member's queues and, when clustered, every other member's.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the local batch could not be
    /// written. The batch is dropped in that case.
    pub async fn flush_pending_items(&self) -> Result<usize, PersistenceError> {
        self.flush_pending_items_with(true).await
    }

    /// Writes the pending queues to the backend as one batch.
    ///
    /// With `send_to_cluster` set and clustering enabled, the other members
    /// are told to flush first. Their failures are logged and do not fail the
    /// local flush. Returns the number of row operations written.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the local batch could not be
    /// written. The batch is dropped in that case.
    pub async fn flush_pending_items_with(
        &self,
        send_to_cluster: bool,
    ) -> Result<usize, PersistenceError> {
        if send_to_cluster && self.cluster.is_clustering_enabled() {
            if let Err(e) = self.cluster.broadcast(ClusterTask::FlushPendingItems).await {
                warn!(error = %e, "cluster flush did not complete on every member");
            }
        }

        let _flush = self.flush_lock.lock().await;
        let batch = {
            let mut pending = self.pending.lock();
            let batch = pending.take_batch();
            for item in &batch.inserts {
                if !self.cache.contains(&item.key()) {
                    self.cache.put(item.clone());
                }
            }
            batch
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let (inserts, deletes) = (batch.inserts.len(), batch.deletes.len());
        let written = self.store.write_batch(batch).await;
        self.pending.lock().finish_batch();
        match written {
            Ok(()) => {
                debug!(inserts, deletes, "flushed pending items");
                Ok(inserts + deletes)
            }
            Err(e) => {
                error!(
                    inserts,
                    deletes,
                    error = %e,
                    "failed to flush pending items, batch dropped"
                );
                Err(e.into())
            }
        }
    }

    /// Flushes while holding the cache-wide lock, so no read miss can load a
    /// row the batch is about to change.
    ///
    /// # Errors
    ///
    /// See [`flush_pending_items`](Self::flush_pending_items).
    pub async fn safe_flush_pending_items(&self) -> Result<usize, PersistenceError> {
        let _guard = self.cache.lock().await;
        self.flush_pending_items().await
    }

    /// Deletes every stored item of `node`.
    ///
    /// Only when the backend succeeds are the node's pending inserts dropped
    /// and its items evicted from the cache; on failure local state is left
    /// untouched. Read misses wait for the purge to finish.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the backend purge fails.
    pub async fn purge_node(&self, node: &LeafNode) -> Result<(), PersistenceError> {
        let _guard = self.cache.lock().await;
        let _flush = self.flush_lock.lock().await;
        match self.store.purge_node(node).await {
            Ok(()) => {
                let dropped = self.pending.lock().cancel_node(&node.node_id);
                let evicted = self.cache.evict_node(&node.node_id);
                info!(node = %node.node_id, dropped, evicted, "purged node items");
                Ok(())
            }
            Err(e) => {
                error!(node = %node.node_id, error = %e, "failed to purge node items");
                Err(e.into())
            }
        }
    }

    /// Removes stored items the configured retention policy expires.
    ///
    /// Removed rows are evicted from the cache, as are cached items older
    /// than the age cutoff. Read misses wait for the purge to finish.
    /// Returns the number of rows removed from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the backend purge fails.
    pub async fn purge_expired_items(&self) -> Result<u64, PersistenceError> {
        let policy = self.config.retention;
        if policy.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();

        let _guard = self.cache.lock().await;
        let removed = self.store.purge_expired(&policy, now).await.map_err(|e| {
            error!(error = %e, "failed to purge expired items");
            PersistenceError::from(e)
        })?;
        let mut evicted = 0;
        for key in &removed {
            if self.cache.remove(key).is_some() {
                evicted += 1;
            }
        }
        evicted += policy
            .cutoff(now)
            .map_or(0, |cutoff| self.cache.evict_created_before(cutoff));

        let removed = u64::try_from(removed.len()).unwrap_or(u64::MAX);
        if removed > 0 || evicted > 0 {
            info!(removed, evicted, "purged expired items");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Starts the periodic flush and purge timers.
    ///
    /// Returns `false` if they were already started for this engine.
    pub fn start_timers(self: &Arc<Self>) -> bool {
        self.timers.start(self)
    }

    #[must_use]
    pub fn timers(&self) -> &PubSubTimers {
        &self.timers
    }

    /// Stops the timers, writes the pending queues, and runs a final purge.
    ///
    /// Both steps run even if the first fails; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Backend`] if the flush or the purge fails.
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        self.timers.stop().await;
        let flushed = self.flush_pending_items_with(false).await;
        let purged = self.purge_expired_items().await;
        info!(
            flushed = flushed.is_ok(),
            purged = purged.is_ok(),
            "pub-sub persistence shut down"
        );
        flushed?;
        purged?;
        Ok(())
    }
}

#[async_trait]
impl ClusterTaskHandler for PubSubPersistence {
    async fn handle_task(&self, task: ClusterTask) -> anyhow::Result<()> {
        match task {
            ClusterTask::FlushPendingItems => {
                self.flush_pending_items_with(false).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use aerie_core::ManualClock;

    use super::*;
    use crate::cluster::LoopbackCluster;
    use crate::pubsub::test_support::ProbeStore;
    use crate::storage::{FlushBatch, RetentionPolicy};

    fn node() -> LeafNode {
        LeafNode::new("princely_musings")
    }

    fn item(node: &LeafNode, id: &str, created: u64) -> PublishedItem {
        PublishedItem::new(node, id, "hamlet@denmark.lit", id.as_bytes().to_vec(), created)
    }

    fn config(max_items_flush: usize) -> PubSubConfig {
        PubSubConfig {
            max_items_flush,
            ..PubSubConfig::default()
        }
    }

    fn engine(store: &Arc<ProbeStore>, config: PubSubConfig) -> Arc<PubSubPersistence> {
        Arc::new(PubSubPersistence::new(store.clone(), config))
    }

    async fn seed(store: &ProbeStore, items: Vec<PublishedItem>) {
        store
            .inner
            .write_batch(FlushBatch {
                inserts: items,
                deletes: Vec::new(),
            })
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn saved_item_is_served_from_cache() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let node = node();

        engine.save_published_item(item(&node, "a", 1)).await;

        let got = engine.get_published_item(&node, "a").await.expect("get");
        assert_eq!(got.map(|i| i.item_id), Some("a".to_string()));
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pending_insert_count(), 1);
    }

    #[tokio::test]
    async fn republish_before_flush_writes_once() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let node = node();

        engine.save_published_item(item(&node, "a", 1)).await;
        engine.save_published_item(item(&node, "a", 2)).await;
        assert_eq!(engine.pending_insert_count(), 1);
        assert_eq!(engine.pending_delete_count(), 1);

        assert_eq!(engine.flush_pending_items().await.expect("flush"), 2);

        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].inserts.len(), 1);
        assert_eq!(batches[0].inserts[0].creation_date, 2);
        assert_eq!(batches[0].deletes, vec![node.item_key("a")]);
    }

    #[tokio::test]
    async fn remove_then_get_is_absent() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let node = node();
        let a = item(&node, "a", 1);

        engine.save_published_item(a.clone()).await;
        engine.remove_published_item(&a);

        assert!(engine.get_published_item(&node, "a").await.expect("get").is_none());
        assert_eq!(engine.pending_insert_count(), 0);
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_of_stored_item_hides_it_before_flush() {
        let store = Arc::new(ProbeStore::default());
        let node = node();
        let a = item(&node, "a", 1);
        seed(&store, vec![a.clone()]).await;
        let engine = engine(&store, config(100));

        engine.remove_published_item(&a);
        assert!(engine.get_published_item(&node, "a").await.expect("get").is_none());

        engine.flush_pending_items().await.expect("flush");
        assert!(store.inner.load_item(&node, "a").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn exceeding_threshold_triggers_flush() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(3));
        let node = node();

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            engine.save_published_item(item(&node, id, i as u64)).await;
        }
        assert!(store.batches().is_empty());

        engine.save_published_item(item(&node, "d", 4)).await;
        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].inserts.len(), 4);
        assert_eq!(engine.pending_insert_count(), 0);
    }

    #[tokio::test]
    async fn zero_threshold_flushes_every_save() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(0));
        let node = node();

        engine.save_published_item(item(&node, "a", 1)).await;
        engine.save_published_item(item(&node, "b", 2)).await;
        assert_eq!(store.batches().len(), 2);
    }

    #[tokio::test]
    async fn miss_loads_once_then_caches() {
        let store = Arc::new(ProbeStore::default());
        let node = node();
        seed(&store, vec![item(&node, "a", 1)]).await;
        let engine = engine(&store, config(100));

        assert!(engine.get_published_item(&node, "a").await.expect("get").is_some());
        assert!(engine.get_published_item(&node, "a").await.expect("get").is_some());
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert!(engine.cache().contains(&node.item_key("a")));
    }

    #[tokio::test]
    async fn absent_item_is_none() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        assert!(engine
            .get_published_item(&node(), "nothing")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_load_once() {
        let store = Arc::new(ProbeStore::with_load_delay(Duration::from_millis(50)));
        let node = node();
        seed(&store, vec![item(&node, "a", 1)]).await;
        let engine = engine(&store, config(100));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            let node = node.clone();
            tasks.push(tokio::spawn(async move {
                engine.get_published_item(&node, "a").await
            }));
        }
        for task in tasks {
            let got = task.await.expect("join").expect("get");
            assert_eq!(got.map(|i| i.item_id), Some("a".to_string()));
        }
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_read_error_is_surfaced() {
        let store = Arc::new(ProbeStore::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        let engine = engine(&store, config(100));

        let err = engine
            .get_published_item(&node(), "a")
            .await
            .expect_err("read fails");
        assert!(matches!(err, PersistenceError::Backend(_)));
    }

    #[tokio::test]
    async fn purge_node_clears_pending_and_cache() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let n = node();
        let m = LeafNode::new("other");

        engine.save_published_item(item(&n, "a", 1)).await;
        engine.flush_pending_items().await.expect("flush");
        engine.save_published_item(item(&n, "b", 2)).await;
        engine.save_published_item(item(&m, "x", 3)).await;

        engine.purge_node(&n).await.expect("purge");

        assert_eq!(engine.pending_insert_count(), 1);
        assert!(!engine.cache().contains(&n.item_key("a")));
        assert!(!engine.cache().contains(&n.item_key("b")));
        assert!(engine.cache().contains(&m.item_key("x")));
        assert!(store.inner.load_items(&n, 10).await.expect("load").is_empty());
        assert_eq!(store.node_purges.load(Ordering::SeqCst), 1);

        engine.flush_pending_items().await.expect("flush");
        let last = store.batches().pop().expect("batch");
        assert_eq!(last.inserts.len(), 1);
        assert_eq!(last.inserts[0].node_id, "other");
    }

    #[tokio::test]
    async fn failed_purge_leaves_local_state() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let n = node();

        engine.save_published_item(item(&n, "a", 1)).await;
        store.fail_purge.store(true, Ordering::SeqCst);

        assert!(engine.purge_node(&n).await.is_err());
        assert_eq!(store.node_purges.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_insert_count(), 1);
        assert!(engine.cache().contains(&n.item_key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn read_during_flush_keeps_removed_item_hidden() {
        let store = Arc::new(ProbeStore::with_write_delay(Duration::from_millis(200)));
        let n = node();
        let a = item(&n, "a", 1);
        seed(&store, vec![a.clone()]).await;
        let engine = engine(&store, config(100));

        engine.remove_published_item(&a);
        let flush = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.flush_pending_items().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.get_published_item(&n, "a").await.expect("get").is_none());
        flush.await.expect("join").expect("flush");

        assert!(engine.get_published_item(&n, "a").await.expect("get").is_none());
        assert!(!engine.cache().contains(&n.item_key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn read_overlapping_flush_does_not_cache_old_row() {
        let store = Arc::new(ProbeStore::with_load_delay(Duration::from_millis(200)));
        let n = node();
        let a = item(&n, "a", 1);
        seed(&store, vec![a.clone()]).await;
        let engine = engine(&store, config(100));

        let read = {
            let engine = Arc::clone(&engine);
            let n = n.clone();
            tokio::spawn(async move { engine.get_published_item(&n, "a").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.remove_published_item(&a);
        engine.flush_pending_items().await.expect("flush");

        read.await.expect("join").expect("get");
        assert!(!engine.cache().contains(&n.item_key("a")));
        assert!(engine.get_published_item(&n, "a").await.expect("get").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_node_evicts_item_loaded_during_purge() {
        let store = Arc::new(ProbeStore::with_load_delay(Duration::from_millis(100)));
        let n = node();
        seed(&store, vec![item(&n, "a", 1)]).await;
        let engine = engine(&store, config(100));

        let read = {
            let engine = Arc::clone(&engine);
            let n = n.clone();
            tokio::spawn(async move { engine.get_published_item(&n, "a").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.purge_node(&n).await.expect("purge");
        read.await.expect("join").expect("get");

        assert_eq!(store.node_purges.load(Ordering::SeqCst), 1);
        assert!(!engine.cache().contains(&n.item_key("a")));
        assert!(engine.get_published_item(&n, "a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn failed_flush_drops_batch() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let n = node();

        engine.save_published_item(item(&n, "a", 1)).await;
        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(engine.flush_pending_items().await.is_err());
        assert_eq!(engine.pending_insert_count(), 0);

        store.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(engine.flush_pending_items().await.expect("flush"), 0);
        // Still readable from the cache until evicted.
        assert!(engine.get_published_item(&n, "a").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn flush_recaches_evicted_pending_items() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let n = node();

        engine.save_published_item(item(&n, "a", 1)).await;
        engine.cache().remove(&n.item_key("a"));

        engine.safe_flush_pending_items().await.expect("flush");
        assert!(engine.cache().contains(&n.item_key("a")));
    }

    #[tokio::test]
    async fn fetch_limits() {
        let store = Arc::new(ProbeStore::default());
        let n = node();
        seed(&store, (0..10).map(|i| item(&n, &format!("i{i}"), i)).collect()).await;
        let engine = engine(
            &store,
            PubSubConfig {
                max_rows_fetch: 5,
                ..PubSubConfig::default()
            },
        );

        let all = engine.get_published_items(&n).await.expect("items");
        let ids: Vec<_> = all.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["i5", "i6", "i7", "i8", "i9"]);

        let capped = n.clone().with_max_published_items(3);
        assert_eq!(engine.get_published_items(&capped).await.expect("items").len(), 3);

        let large = n.clone().with_max_published_items(50);
        assert_eq!(engine.get_published_items(&large).await.expect("items").len(), 5);

        assert_eq!(
            engine.get_published_items_with_limit(&n, 100).await.expect("items").len(),
            5
        );
        assert_eq!(
            engine.get_published_items_with_limit(&n, 2).await.expect("items").len(),
            2
        );
    }

    #[tokio::test]
    async fn last_published_prefers_newest_and_pending_on_tie() {
        let store = Arc::new(ProbeStore::default());
        let n = node();
        seed(&store, vec![item(&n, "stored", 10)]).await;
        let engine = engine(&store, config(100));

        let last = engine.get_last_published_item(&n).await.expect("last");
        assert_eq!(last.map(|i| i.item_id), Some("stored".to_string()));

        engine.save_published_item(item(&n, "older", 5)).await;
        let last = engine.get_last_published_item(&n).await.expect("last");
        assert_eq!(last.map(|i| i.item_id), Some("stored".to_string()));

        engine.save_published_item(item(&n, "tied", 10)).await;
        let last = engine.get_last_published_item(&n).await.expect("last");
        assert_eq!(last.map(|i| i.item_id), Some("tied".to_string()));
    }

    #[tokio::test]
    async fn last_published_skips_removed_stored_item() {
        let store = Arc::new(ProbeStore::default());
        let n = node();
        let stored = item(&n, "stored", 10);
        seed(&store, vec![stored.clone()]).await;
        let engine = engine(&store, config(100));

        engine.remove_published_item(&stored);
        assert!(engine.get_last_published_item(&n).await.expect("last").is_none());
    }

    #[tokio::test]
    async fn flush_reaches_other_cluster_members() {
        let shared = Arc::new(ProbeStore::default());
        let cluster = LoopbackCluster::new();
        let member_a = cluster.join("a");
        let member_b = cluster.join("b");

        let a = Arc::new(
            PubSubPersistence::new(shared.clone(), config(100)).with_cluster(member_a.clone()),
        );
        let b = Arc::new(
            PubSubPersistence::new(shared.clone(), config(100)).with_cluster(member_b.clone()),
        );
        member_a.attach(&a);
        member_b.attach(&b);

        let n = node();
        b.save_published_item(item(&n, "from-b", 1)).await;

        a.flush_pending_items().await.expect("flush");
        assert_eq!(b.pending_insert_count(), 0);
        assert!(shared.inner.load_item(&n, "from-b").await.expect("load").is_some());
    }

    #[tokio::test]
    async fn local_flush_does_not_broadcast() {
        let shared = Arc::new(ProbeStore::default());
        let cluster = LoopbackCluster::new();
        let member_a = cluster.join("a");
        let member_b = cluster.join("b");
        let a = Arc::new(
            PubSubPersistence::new(shared.clone(), config(100)).with_cluster(member_a.clone()),
        );
        let b = Arc::new(
            PubSubPersistence::new(shared.clone(), config(100)).with_cluster(member_b.clone()),
        );
        member_a.attach(&a);
        member_b.attach(&b);

        b.save_published_item(item(&node(), "from-b", 1)).await;
        a.flush_pending_items_with(false).await.expect("flush");
        assert_eq!(b.pending_insert_count(), 1);
    }

    #[tokio::test]
    async fn expired_items_are_purged_and_evicted() {
        let store = Arc::new(ProbeStore::default());
        let clock = Arc::new(ManualClock::new(0));
        let engine = Arc::new(
            PubSubPersistence::new(
                store.clone(),
                PubSubConfig {
                    retention: RetentionPolicy {
                        max_item_age: Some(Duration::from_secs(60)),
                        max_items_per_node: None,
                    },
                    ..config(100)
                },
            )
            .with_clock(clock.clone()),
        );
        let n = node();

        engine.save_published_item(item(&n, "old", 0)).await;
        engine.save_published_item(item(&n, "new", 100_000)).await;
        engine.flush_pending_items().await.expect("flush");

        clock.set(120_000);
        assert_eq!(engine.purge_expired_items().await.expect("purge"), 1);
        assert!(!engine.cache().contains(&n.item_key("old")));
        assert!(engine.cache().contains(&n.item_key("new")));
        let left = store.inner.load_items(&n, 10).await.expect("load");
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn trimmed_items_are_evicted() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(
            &store,
            PubSubConfig {
                retention: RetentionPolicy {
                    max_item_age: None,
                    max_items_per_node: Some(1),
                },
                ..config(100)
            },
        );
        let n = node();

        engine.save_published_item(item(&n, "a", 1)).await;
        engine.save_published_item(item(&n, "b", 2)).await;
        engine.flush_pending_items().await.expect("flush");

        assert_eq!(engine.purge_expired_items().await.expect("purge"), 1);
        assert!(!engine.cache().contains(&n.item_key("a")));
        assert!(engine.get_published_item(&n, "a").await.expect("get").is_none());
        assert!(engine.get_published_item(&n, "b").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_items() {
        let store = Arc::new(ProbeStore::default());
        let engine = engine(&store, config(100));
        let n = node();

        engine.save_published_item(item(&n, "a", 1)).await;
        engine.shutdown().await.expect("shutdown");

        assert_eq!(engine.pending_insert_count(), 0);
        assert!(store.inner.load_item(&n, "a").await.expect("load").is_some());
    }
}
