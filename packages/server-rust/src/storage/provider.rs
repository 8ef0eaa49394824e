//! Durable storage contract for published items.
//!
//! Defines [`PubSubStore`], the backend the persistence engine writes
//! through. The engine buffers saves and removals and hands them over as one
//! [`FlushBatch`]; everything else is a direct read or a purge.

use std::collections::HashMap;
use std::time::Duration;

use aerie_core::{ItemKey, LeafNode, PublishedItem};
use async_trait::async_trait;

/// Pending writes swapped out of the engine's queues in one step.
///
/// Backends apply the batch in a single transaction, `deletes` first and
/// `inserts` second. Inserts are upserts keyed by [`ItemKey`], so a key that
/// appears in both lists ends up holding the inserted item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushBatch {
    /// Items to write, in publication order.
    pub inserts: Vec<PublishedItem>,
    /// Keys to delete, each at most once.
    pub deletes: Vec<ItemKey>,
}

impl FlushBatch {
    /// Whether the batch carries no work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    /// Total number of row operations in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inserts.len() + self.deletes.len()
    }
}

/// Which stored items the periodic purge removes.
///
/// Both limits are optional; an empty policy purges nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Items published longer ago than this are removed.
    pub max_item_age: Option<Duration>,
    /// Each node keeps at most this many of its newest items.
    pub max_items_per_node: Option<usize>,
}

impl RetentionPolicy {
    /// Whether the policy removes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_item_age.is_none() && self.max_items_per_node.is_none()
    }

    /// Creation time (epoch millis) before which items count as expired.
    #[must_use]
    pub fn cutoff(&self, now: u64) -> Option<u64> {
        self.max_item_age.map(|age| {
            let age_millis = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
            now.saturating_sub(age_millis)
        })
    }

    /// Selects the keys this policy expires out of `items`.
    ///
    /// `items` yields `(key, creation_date)` for every stored row. Used by
    /// backends that cannot express the policy as a query.
    pub fn expired_keys(
        &self,
        items: impl IntoIterator<Item = (ItemKey, u64)>,
        now: u64,
    ) -> Vec<ItemKey> {
        if self.is_empty() {
            return Vec::new();
        }
        let cutoff = self.cutoff(now);

        let mut expired = Vec::new();
        let mut per_node: HashMap<String, Vec<(u64, ItemKey)>> = HashMap::new();
        for (key, created) in items {
            if cutoff.is_some_and(|cutoff| created < cutoff) {
                expired.push(key);
            } else {
                per_node
                    .entry(key.node_id.clone())
                    .or_default()
                    .push((created, key));
            }
        }

        if let Some(max) = self.max_items_per_node {
            for (_, mut rows) in per_node {
                if rows.len() <= max {
                    continue;
                }
                // Newest first; ties broken by item id for a stable result.
                rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.item_id.cmp(&a.1.item_id)));
                expired.extend(rows.into_iter().skip(max).map(|(_, key)| key));
            }
        }
        expired
    }
}

/// Durable store for published items.
///
/// Calls may block on I/O for their whole duration. Implementations must
/// tolerate deleting keys that do not exist.
///
/// Used as `Arc<dyn PubSubStore>`.
#[async_trait]
pub trait PubSubStore: Send + Sync {
    /// Load a single item. Returns `None` if it is not stored.
    async fn load_item(&self, node: &LeafNode, item_id: &str)
        -> anyhow::Result<Option<PublishedItem>>;

    /// Load the newest `max_rows` items of `node`, oldest first.
    async fn load_items(&self, node: &LeafNode, max_rows: usize)
        -> anyhow::Result<Vec<PublishedItem>>;

    /// Apply a flush batch as one transaction (deletes, then upserts).
    async fn write_batch(&self, batch: FlushBatch) -> anyhow::Result<()>;

    /// Remove every stored item of `node`.
    async fn purge_node(&self, node: &LeafNode) -> anyhow::Result<()>;

    /// Remove items the retention policy expires. Returns the removed keys.
    async fn purge_expired(
        &self,
        policy: &RetentionPolicy,
        now: u64,
    ) -> anyhow::Result<Vec<ItemKey>>;
}
