//! Pub-sub item persistence: write-back engine, pending queues, timers.

pub mod engine;
pub mod pending;
pub mod timers;

pub use engine::PubSubPersistence;
pub use pending::{PendingInserts, PendingQueues};
pub use timers::PubSubTimers;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use aerie_core::{ItemKey, LeafNode, PublishedItem};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::storage::datastores::MemoryStore;
    use crate::storage::{FlushBatch, PubSubStore, RetentionPolicy};

    /// [`MemoryStore`] wrapper that counts calls and injects failures.
    #[derive(Default)]
    pub(crate) struct ProbeStore {
        pub inner: MemoryStore,
        pub loads: AtomicUsize,
        pub purges: AtomicUsize,
        pub node_purges: AtomicUsize,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
        pub fail_purge: AtomicBool,
        load_delay: Duration,
        write_delay: Duration,
        batches: Mutex<Vec<FlushBatch>>,
    }

    impl ProbeStore {
        pub fn with_load_delay(load_delay: Duration) -> Self {
            Self {
                load_delay,
                ..Self::default()
            }
        }

        /// Delays `write_batch` and `purge_node` by `write_delay`.
        pub fn with_write_delay(write_delay: Duration) -> Self {
            Self {
                write_delay,
                ..Self::default()
            }
        }

        async fn write_pause(&self) {
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
        }

        /// Every batch handed to `write_batch`, in order.
        pub fn batches(&self) -> Vec<FlushBatch> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl PubSubStore for ProbeStore {
        async fn load_item(
            &self,
            node: &LeafNode,
            item_id: &str,
        ) -> anyhow::Result<Option<PublishedItem>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                anyhow::bail!("read failed");
            }
            // The row is read first and returned late.
            let loaded = self.inner.load_item(node, item_id).await;
            if !self.load_delay.is_zero() {
                tokio::time::sleep(self.load_delay).await;
            }
            loaded
        }

        async fn load_items(
            &self,
            node: &LeafNode,
            max_rows: usize,
        ) -> anyhow::Result<Vec<PublishedItem>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                anyhow::bail!("read failed");
            }
            self.inner.load_items(node, max_rows).await
        }

        async fn write_batch(&self, batch: FlushBatch) -> anyhow::Result<()> {
            self.batches.lock().push(batch.clone());
            self.write_pause().await;
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("write failed");
            }
            self.inner.write_batch(batch).await
        }

        async fn purge_node(&self, node: &LeafNode) -> anyhow::Result<()> {
            self.node_purges.fetch_add(1, Ordering::SeqCst);
            self.write_pause().await;
            if self.fail_purge.load(Ordering::SeqCst) {
                anyhow::bail!("purge failed");
            }
            self.inner.purge_node(node).await
        }

        async fn purge_expired(
            &self,
            policy: &RetentionPolicy,
            now: u64,
        ) -> anyhow::Result<Vec<ItemKey>> {
            self.purges.fetch_add(1, Ordering::SeqCst);
            self.inner.purge_expired(policy, now).await
        }
    }
}
