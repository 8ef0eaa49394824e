//! Backend contract for checking out id blocks.

use aerie_core::{IdBlock, IdType};
use async_trait::async_trait;

/// Durable counter per [`IdType`], advanced one block at a time.
///
/// Implementations read the stored counter, creating the row at `1` (with a
/// warning) if it is missing, then advance it by `block_size` with a
/// compare-and-swap on the value they read.
#[async_trait]
pub trait UidProvider: Send + Sync {
    /// Checks out the next `block_size` ids of `id_type`.
    ///
    /// Returns `Ok(None)` when another writer advanced the counter between
    /// the read and the update; the caller may retry.
    async fn next_block(&self, id_type: IdType, block_size: u32) -> anyhow::Result<Option<IdBlock>>;
}
