//! Embedded backend on a single redb file.
//!
//! Items are stored `MsgPack`-encoded under a `(node_id, item_id)` key, so a
//! node's items form one contiguous key range. redb calls block, so every
//! operation runs on the blocking thread pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aerie_core::{IdBlock, IdType, ItemKey, LeafNode, PublishedItem};
use anyhow::Context;
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::task;
use tracing::{debug, warn};

use crate::properties::PropertiesProvider;
use crate::sequence::UidProvider;
use crate::storage::{FlushBatch, PubSubStore, RetentionPolicy};

const ITEMS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("pubsub_items");
const IDS: TableDefinition<i32, i64> = TableDefinition::new("id_blocks");
const PROPERTIES: TableDefinition<&str, &str> = TableDefinition::new("properties");

/// Durable implementation of every backend trait on one redb database.
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStore {
    /// Opens or creates the database at `path` and its tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a redb
    /// database.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let db = task::spawn_blocking(move || -> anyhow::Result<Database> {
            let db = Database::create(&open_path)
                .with_context(|| format!("failed to open redb database {}", open_path.display()))?;
            let txn = db.begin_write()?;
            txn.open_table(ITEMS)?;
            txn.open_table(IDS)?;
            txn.open_table(PROPERTIES)?;
            txn.commit()?;
            Ok(db)
        })
        .await
        .context("redb open task failed")??;

        debug!(path = %path.display(), "opened redb store");
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || op(&db))
            .await
            .context("redb task failed")?
    }
}

fn decode(bytes: &[u8]) -> anyhow::Result<PublishedItem> {
    rmp_serde::from_slice(bytes).context("corrupt published item row")
}

#[async_trait]
impl PubSubStore for RedbStore {
    async fn load_item(
        &self,
        node: &LeafNode,
        item_id: &str,
    ) -> anyhow::Result<Option<PublishedItem>> {
        let node_id = node.node_id.clone();
        let item_id = item_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(ITEMS)?;
            let row = table.get((node_id.as_str(), item_id.as_str()))?;
            row.map(|guard| decode(guard.value())).transpose()
        })
        .await
    }

    async fn load_items(
        &self,
        node: &LeafNode,
        max_rows: usize,
    ) -> anyhow::Result<Vec<PublishedItem>> {
        let node_id = node.node_id.clone();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(ITEMS)?;
            let mut items = Vec::new();
            for entry in table.range((node_id.as_str(), "")..)? {
                let (key, value) = entry?;
                if key.value().0 != node_id {
                    break;
                }
                items.push(decode(value.value())?);
            }
            items.sort_by(|a, b| {
                a.creation_date
                    .cmp(&b.creation_date)
                    .then_with(|| a.item_id.cmp(&b.item_id))
            });
            let skip = items.len().saturating_sub(max_rows);
            Ok(items.split_off(skip))
        })
        .await
    }

    async fn write_batch(&self, batch: FlushBatch) -> anyhow::Result<()> {
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(ITEMS)?;
                for key in &batch.deletes {
                    table.remove((key.node_id.as_str(), key.item_id.as_str()))?;
                }
                for item in &batch.inserts {
                    let bytes = rmp_serde::to_vec_named(item)?;
                    table.insert(
                        (item.node_id.as_str(), item.item_id.as_str()),
                        bytes.as_slice(),
                    )?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_node(&self, node: &LeafNode) -> anyhow::Result<()> {
        let node_id = node.node_id.clone();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(ITEMS)?;
                let mut item_ids = Vec::new();
                for entry in table.range((node_id.as_str(), "")..)? {
                    let (key, _) = entry?;
                    let (node, item) = key.value();
                    if node != node_id {
                        break;
                    }
                    item_ids.push(item.to_string());
                }
                for item_id in &item_ids {
                    table.remove((node_id.as_str(), item_id.as_str()))?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(
        &self,
        policy: &RetentionPolicy,
        now: u64,
    ) -> anyhow::Result<Vec<ItemKey>> {
        if policy.is_empty() {
            return Ok(Vec::new());
        }
        let policy = *policy;
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(ITEMS)?;
                let mut rows = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    let item = decode(value.value())?;
                    rows.push((item.key(), item.creation_date));
                }
                let mut removed = Vec::new();
                for key in policy.expired_keys(rows, now) {
                    if table
                        .remove((key.node_id.as_str(), key.item_id.as_str()))?
                        .is_some()
                    {
                        removed.push(key);
                    }
                }
                removed
            };
            txn.commit()?;
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl UidProvider for RedbStore {
    async fn next_block(
        &self,
        id_type: IdType,
        block_size: u32,
    ) -> anyhow::Result<Option<IdBlock>> {
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let block = {
                let mut table = txn.open_table(IDS)?;
                let stored = table.get(id_type.0)?.map(|guard| guard.value());
                let current = match stored {
                    Some(current) => current,
                    None => {
                        warn!(%id_type, "no id row for type, creating one starting at 1");
                        table.insert(id_type.0, 1_i64)?;
                        1
                    }
                };
                let next = current + i64::from(block_size);
                // Write transactions are serialized, so the row cannot have
                // moved since it was read.
                table.insert(id_type.0, next)?;
                IdBlock::new(current, next)
            };
            txn.commit()?;
            Ok(Some(block))
        })
        .await
    }
}

#[async_trait]
impl PropertiesProvider for RedbStore {
    async fn load_properties(&self) -> anyhow::Result<HashMap<String, String>> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(PROPERTIES)?;
            let mut properties = HashMap::new();
            for entry in table.iter()? {
                let (name, value) = entry?;
                properties.insert(name.value().to_string(), value.value().to_string());
            }
            Ok(properties)
        })
        .await
    }

    async fn insert_property(&self, name: &str, value: &str) -> anyhow::Result<()> {
        let (name, value) = (name.to_string(), value.to_string());
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            txn.open_table(PROPERTIES)?
                .insert(name.as_str(), value.as_str())?;
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_property(&self, name: &str, value: &str) -> anyhow::Result<()> {
        let (name, value) = (name.to_string(), value.to_string());
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(PROPERTIES)?;
                let exists = table.get(name.as_str())?.is_some();
                if exists {
                    table.insert(name.as_str(), value.as_str())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_property(&self, name: &str) -> anyhow::Result<()> {
        let prefix = name.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(PROPERTIES)?;
                let mut names = Vec::new();
                for entry in table.range(prefix.as_str()..)? {
                    let (name, _) = entry?;
                    let name = name.value();
                    if !name.starts_with(prefix.as_str()) {
                        break;
                    }
                    names.push(name.to_string());
                }
                for name in &names {
                    table.remove(name.as_str())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn item(node: &str, id: &str, created: u64) -> PublishedItem {
        PublishedItem::new(
            &LeafNode::new(node),
            id,
            "horatio@denmark.lit",
            format!("<entry>{id}</entry>").into_bytes(),
            created,
        )
    }

    async fn open(dir: &tempfile::TempDir) -> RedbStore {
        RedbStore::open(dir.path().join("aerie.redb"))
            .await
            .expect("open redb")
    }

    #[tokio::test]
    async fn items_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = LeafNode::new("n");
        {
            let store = open(&dir).await;
            store
                .write_batch(FlushBatch {
                    inserts: vec![item("n", "a", 1)],
                    deletes: Vec::new(),
                })
                .await
                .expect("write");
        }

        let store = open(&dir).await;
        let loaded = store.load_item(&node, "a").await.expect("load");
        assert_eq!(loaded, Some(item("n", "a", 1)));
        assert!(store.load_item(&node, "missing").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn batch_upserts_after_deletes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir).await;
        let node = LeafNode::new("n");

        store
            .write_batch(FlushBatch {
                inserts: vec![item("n", "a", 1), item("n", "b", 2)],
                deletes: Vec::new(),
            })
            .await
            .expect("seed");
        store
            .write_batch(FlushBatch {
                inserts: vec![item("n", "a", 3)],
                deletes: vec![node.item_key("a"), node.item_key("b")],
            })
            .await
            .expect("batch");

        let items = store.load_items(&node, 10).await.expect("load");
        assert_eq!(items, vec![item("n", "a", 3)]);
    }

    #[tokio::test]
    async fn node_ranges_do_not_bleed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir).await;
        store
            .write_batch(FlushBatch {
                inserts: vec![
                    item("n", "a", 1),
                    item("n", "b", 2),
                    item("n", "c", 3),
                    item("n2", "a", 4),
                    item("m", "a", 5),
                ],
                deletes: Vec::new(),
            })
            .await
            .expect("seed");

        let newest = store.load_items(&LeafNode::new("n"), 2).await.expect("load");
        let ids: Vec<_> = newest.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        store.purge_node(&LeafNode::new("n")).await.expect("purge");
        assert!(store.load_items(&LeafNode::new("n"), 10).await.expect("load").is_empty());
        assert_eq!(store.load_items(&LeafNode::new("n2"), 10).await.expect("load").len(), 1);
        assert_eq!(store.load_items(&LeafNode::new("m"), 10).await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn purge_expired_applies_both_limits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir).await;
        store
            .write_batch(FlushBatch {
                inserts: vec![
                    item("n", "ancient", 0),
                    item("n", "a", 100_000),
                    item("n", "b", 100_001),
                    item("n", "c", 100_002),
                ],
                deletes: Vec::new(),
            })
            .await
            .expect("seed");

        let policy = RetentionPolicy {
            max_item_age: Some(Duration::from_secs(60)),
            max_items_per_node: Some(2),
        };
        let mut removed = store.purge_expired(&policy, 120_000).await.expect("purge");
        removed.sort();
        assert_eq!(removed, vec![ItemKey::new("n", "a"), ItemKey::new("n", "ancient")]);

        let left = store.load_items(&LeafNode::new("n"), 10).await.expect("load");
        let ids: Vec<_> = left.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
    }

    #[tokio::test]
    async fn id_blocks_are_contiguous_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = open(&dir).await;
            let block = store.next_block(IdType::MUC_ROOM, 10).await.expect("block");
            assert_eq!(block, Some(IdBlock::new(1, 11)));
        }
        let store = open(&dir).await;
        let block = store.next_block(IdType::MUC_ROOM, 10).await.expect("block");
        assert_eq!(block, Some(IdBlock::new(11, 21)));
    }

    #[tokio::test]
    async fn properties_delete_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir).await;
        store.insert_property("xmpp.pubsub.flush.max", "10").await.expect("insert");
        store.insert_property("xmpp.pubsub.fetch.max", "20").await.expect("insert");
        store.insert_property("xmpp.domain", "denmark.lit").await.expect("insert");
        store.update_property("xmpp.domain", "elsinore.lit").await.expect("update");
        store.update_property("absent", "x").await.expect("update");

        store.delete_property("xmpp.pubsub").await.expect("delete");

        let props = store.load_properties().await.expect("load");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("xmpp.domain").map(String::as_str), Some("elsinore.lit"));
    }
}
