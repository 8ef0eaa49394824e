//! In-memory cache of published items, keyed by [`ItemKey`].
//!
//! The engine serves reads from the cache without locking and falls back to
//! the backend on a miss. [`ItemCache::lock`] hands out the cache-wide guard
//! that serializes miss handling and safe flushes.

use std::sync::Arc;

use aerie_core::{ItemKey, PublishedItem};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Name of the published item cache.
pub const ITEM_CACHE_NAME: &str = "Published Items";

/// Guard returned by [`ItemCache::lock`]. Released on drop.
pub type CacheGuard = OwnedMutexGuard<()>;

/// Concurrent item cache.
///
/// Point operations never block on the cache-wide lock; only callers that
/// need a consistent check-then-act sequence take it.
#[async_trait]
pub trait ItemCache: Send + Sync {
    /// Name the cache was registered under.
    fn name(&self) -> &str;

    /// Returns a copy of the cached item, if any.
    fn get(&self, key: &ItemKey) -> Option<PublishedItem>;

    /// Caches `item` under its own key, replacing any previous entry.
    fn put(&self, item: PublishedItem);

    /// Evicts `key`, returning the evicted item.
    fn remove(&self, key: &ItemKey) -> Option<PublishedItem>;

    fn contains(&self, key: &ItemKey) -> bool;

    /// Evicts every item of `node_id`. Returns the number evicted.
    fn evict_node(&self, node_id: &str) -> usize;

    /// Evicts every item created before `cutoff` (epoch millis).
    fn evict_created_before(&self, cutoff: u64) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires the cache-wide lock.
    async fn lock(&self) -> CacheGuard;
}

/// Process-local [`ItemCache`] backed by a [`DashMap`].
pub struct LocalItemCache {
    name: String,
    entries: DashMap<ItemKey, PublishedItem>,
    lock: Arc<Mutex<()>>,
}

impl LocalItemCache {
    /// Creates an empty cache named [`ITEM_CACHE_NAME`].
    #[must_use]
    pub fn new() -> Self {
        Self::named(ITEM_CACHE_NAME)
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for LocalItemCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemCache for LocalItemCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &ItemKey) -> Option<PublishedItem> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, item: PublishedItem) {
        self.entries.insert(item.key(), item);
    }

    fn remove(&self, key: &ItemKey) -> Option<PublishedItem> {
        self.entries.remove(key).map(|(_, item)| item)
    }

    fn contains(&self, key: &ItemKey) -> bool {
        self.entries.contains_key(key)
    }

    fn evict_node(&self, node_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.belongs_to(node_id));
        before.saturating_sub(self.entries.len())
    }

    fn evict_created_before(&self, cutoff: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, item| item.creation_date >= cutoff);
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    async fn lock(&self) -> CacheGuard {
        Arc::clone(&self.lock).lock_owned().await
    }
}
