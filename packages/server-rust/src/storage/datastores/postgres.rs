//! PostgreSQL backend via sqlx.
//!
//! Schema:
//! ```sql
//! CREATE TABLE pubsub_item (
//!   node_id       TEXT   NOT NULL,
//!   item_id       TEXT   NOT NULL,
//!   publisher     TEXT   NOT NULL,
//!   payload       BYTEA  NOT NULL,
//!   creation_date BIGINT NOT NULL,
//!   PRIMARY KEY (node_id, item_id)
//! );
//! CREATE TABLE aerie_id (id_type INTEGER PRIMARY KEY, id BIGINT NOT NULL);
//! CREATE TABLE aerie_property (name TEXT PRIMARY KEY, prop_value TEXT NOT NULL);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use aerie_core::{IdBlock, IdType, ItemKey, LeafNode, PublishedItem};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, warn};

use crate::properties::PropertiesProvider;
use crate::sequence::UidProvider;
use crate::storage::{FlushBatch, PubSubStore, RetentionPolicy};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pubsub_item (
        node_id TEXT NOT NULL,
        item_id TEXT NOT NULL,
        publisher TEXT NOT NULL,
        payload BYTEA NOT NULL,
        creation_date BIGINT NOT NULL,
        PRIMARY KEY (node_id, item_id)
    )",
    "CREATE INDEX IF NOT EXISTS pubsub_item_node_date ON pubsub_item (node_id, creation_date)",
    "CREATE TABLE IF NOT EXISTS aerie_id (
        id_type INTEGER PRIMARY KEY,
        id BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS aerie_property (
        name TEXT PRIMARY KEY,
        prop_value TEXT NOT NULL
    )",
];

const ITEM_COLUMNS: &str = "node_id, item_id, publisher, payload, creation_date";

/// Shared-database implementation of every backend trait.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects to `url` and creates the schema if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Wraps an existing pool. The schema must already exist.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create schema")?;
        }
        debug!("PostgreSQL schema ready");
        Ok(())
    }
}

fn to_db_millis(millis: u64) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

fn row_to_item(row: &PgRow) -> anyhow::Result<PublishedItem> {
    let creation_date: i64 = row.try_get("creation_date")?;
    Ok(PublishedItem {
        node_id: row.try_get("node_id")?,
        item_id: row.try_get("item_id")?,
        publisher: row.try_get("publisher")?,
        payload: row.try_get("payload")?,
        creation_date: u64::try_from(creation_date).unwrap_or_default(),
    })
}

#[async_trait]
impl PubSubStore for PostgresStore {
    async fn load_item(
        &self,
        node: &LeafNode,
        item_id: &str,
    ) -> anyhow::Result<Option<PublishedItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM pubsub_item WHERE node_id = $1 AND item_id = $2"
        ))
        .bind(&node.node_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn load_items(
        &self,
        node: &LeafNode,
        max_rows: usize,
    ) -> anyhow::Result<Vec<PublishedItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM pubsub_item WHERE node_id = $1 \
             ORDER BY creation_date DESC, item_id DESC LIMIT $2"
        ))
        .bind(&node.node_id)
        .bind(i64::try_from(max_rows).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows.iter().map(row_to_item).collect::<anyhow::Result<Vec<_>>>()?;
        items.reverse();
        Ok(items)
    }

    async fn write_batch(&self, batch: FlushBatch) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in &batch.deletes {
            sqlx::query("DELETE FROM pubsub_item WHERE node_id = $1 AND item_id = $2")
                .bind(&key.node_id)
                .bind(&key.item_id)
                .execute(&mut *tx)
                .await?;
        }
        for item in &batch.inserts {
            sqlx::query(
                "INSERT INTO pubsub_item (node_id, item_id, publisher, payload, creation_date) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (node_id, item_id) DO UPDATE SET \
                 publisher = EXCLUDED.publisher, payload = EXCLUDED.payload, \
                 creation_date = EXCLUDED.creation_date",
            )
            .bind(&item.node_id)
            .bind(&item.item_id)
            .bind(&item.publisher)
            .bind(&item.payload)
            .bind(to_db_millis(item.creation_date))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn purge_node(&self, node: &LeafNode) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM pubsub_item WHERE node_id = $1")
            .bind(&node.node_id)
            .execute(&self.pool)
            .await?;
        debug!(node = %node.node_id, rows = result.rows_affected(), "purged node rows");
        Ok(())
    }

    async fn purge_expired(
        &self,
        policy: &RetentionPolicy,
        now: u64,
    ) -> anyhow::Result<Vec<ItemKey>> {
        let mut removed: Vec<(String, String)> = Vec::new();
        if let Some(cutoff) = policy.cutoff(now) {
            removed.extend(
                sqlx::query_as(
                    "DELETE FROM pubsub_item WHERE creation_date < $1 RETURNING node_id, item_id",
                )
                .bind(to_db_millis(cutoff))
                .fetch_all(&self.pool)
                .await?,
            );
        }
        if let Some(max) = policy.max_items_per_node {
            removed.extend(
                sqlx::query_as(
                    "DELETE FROM pubsub_item p USING ( \
                       SELECT node_id, item_id, ROW_NUMBER() OVER ( \
                         PARTITION BY node_id ORDER BY creation_date DESC, item_id DESC) AS rn \
                       FROM pubsub_item) r \
                     WHERE p.node_id = r.node_id AND p.item_id = r.item_id AND r.rn > $1 \
                     RETURNING p.node_id, p.item_id",
                )
                .bind(i64::try_from(max).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await?,
            );
        }
        Ok(removed
            .into_iter()
            .map(|(node_id, item_id)| ItemKey::new(node_id, item_id))
            .collect())
    }
}

#[async_trait]
impl UidProvider for PostgresStore {
    async fn next_block(
        &self,
        id_type: IdType,
        block_size: u32,
    ) -> anyhow::Result<Option<IdBlock>> {
        let stored: Option<i64> = sqlx::query_scalar("SELECT id FROM aerie_id WHERE id_type = $1")
            .bind(id_type.0)
            .fetch_optional(&self.pool)
            .await?;

        let current = match stored {
            Some(current) => current,
            None => {
                warn!(%id_type, "no id row for type, creating one starting at 1");
                sqlx::query(
                    "INSERT INTO aerie_id (id_type, id) VALUES ($1, 1) ON CONFLICT (id_type) DO NOTHING",
                )
                .bind(id_type.0)
                .execute(&self.pool)
                .await?;
                1
            }
        };
        let next = current + i64::from(block_size);

        let updated = sqlx::query("UPDATE aerie_id SET id = $1 WHERE id_type = $2 AND id = $3")
            .bind(next)
            .bind(id_type.0)
            .bind(current)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok((updated == 1).then_some(IdBlock::new(current, next)))
    }
}

#[async_trait]
impl PropertiesProvider for PostgresStore {
    async fn load_properties(&self) -> anyhow::Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT name, prop_value FROM aerie_property")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> anyhow::Result<(String, String)> {
                Ok((row.try_get("name")?, row.try_get("prop_value")?))
            })
            .collect()
    }

    async fn insert_property(&self, name: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO aerie_property (name, prop_value) VALUES ($1, $2)")
            .bind(name)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_property(&self, name: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE aerie_property SET prop_value = $1 WHERE name = $2")
            .bind(value)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_property(&self, name: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM aerie_property WHERE starts_with(name, $1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
