//! In-memory backend.
//!
//! [`MemoryStore`] keeps items, id counters, and properties in process
//! memory. Nothing survives a restart; it backs tests and single-process
//! deployments that do not need durability.

use std::collections::HashMap;

use aerie_core::{IdBlock, IdType, ItemKey, LeafNode, PublishedItem};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::properties::PropertiesProvider;
use crate::sequence::UidProvider;
use crate::storage::{FlushBatch, PubSubStore, RetentionPolicy};

/// Volatile implementation of every backend trait.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<ItemKey, PublishedItem>>,
    ids: Mutex<HashMap<IdType, i64>>,
    properties: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items across all nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Sets the next id that `id_type` will hand out.
    pub fn set_next_id(&self, id_type: IdType, next: i64) {
        self.ids.lock().insert(id_type, next);
    }
}

#[async_trait]
impl PubSubStore for MemoryStore {
    async fn load_item(
        &self,
        node: &LeafNode,
        item_id: &str,
    ) -> anyhow::Result<Option<PublishedItem>> {
        Ok(self.items.read().get(&node.item_key(item_id)).cloned())
    }

    async fn load_items(
        &self,
        node: &LeafNode,
        max_rows: usize,
    ) -> anyhow::Result<Vec<PublishedItem>> {
        let mut items: Vec<PublishedItem> = self
            .items
            .read()
            .values()
            .filter(|item| item.node_id == node.node_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.creation_date
                .cmp(&b.creation_date)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        let skip = items.len().saturating_sub(max_rows);
        Ok(items.split_off(skip))
    }

    async fn write_batch(&self, batch: FlushBatch) -> anyhow::Result<()> {
        let mut items = self.items.write();
        for key in &batch.deletes {
            items.remove(key);
        }
        for item in batch.inserts {
            items.insert(item.key(), item);
        }
        Ok(())
    }

    async fn purge_node(&self, node: &LeafNode) -> anyhow::Result<()> {
        self.items
            .write()
            .retain(|key, _| !key.belongs_to(&node.node_id));
        Ok(())
    }

    async fn purge_expired(
        &self,
        policy: &RetentionPolicy,
        now: u64,
    ) -> anyhow::Result<Vec<ItemKey>> {
        let mut items = self.items.write();
        let expired = policy.expired_keys(
            items
                .values()
                .map(|item| (item.key(), item.creation_date)),
            now,
        );
        Ok(expired
            .into_iter()
            .filter(|key| items.remove(key).is_some())
            .collect())
    }
}

#[async_trait]
impl UidProvider for MemoryStore {
    async fn next_block(
        &self,
        id_type: IdType,
        block_size: u32,
    ) -> anyhow::Result<Option<IdBlock>> {
        let current = {
            let mut ids = self.ids.lock();
            *ids.entry(id_type).or_insert_with(|| {
                warn!(%id_type, "no id row for type, creating one starting at 1");
                1
            })
        };
        let next = current + i64::from(block_size);

        let mut ids = self.ids.lock();
        match ids.get_mut(&id_type) {
            Some(stored) if *stored == current => {
                *stored = next;
                Ok(Some(IdBlock::new(current, next)))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl PropertiesProvider for MemoryStore {
    async fn load_properties(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.properties.read().clone())
    }

    async fn insert_property(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.properties
            .write()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn update_property(&self, name: &str, value: &str) -> anyhow::Result<()> {
        if let Some(stored) = self.properties.write().get_mut(name) {
            *stored = value.to_string();
        }
        Ok(())
    }

    async fn delete_property(&self, name: &str) -> anyhow::Result<()> {
        self.properties
            .write()
            .retain(|key, _| !key.starts_with(name));
        Ok(())
    }
}
