//! Tasks broadcast between cluster members.
//!
//! Tasks are stateless commands: the variant tag is the whole message.
//! They use named `MsgPack` serialization (`rmp_serde::to_vec_named()`), the
//! same encoding as every other inter-node payload.

use serde::{Deserialize, Serialize};

/// Command sent to the other members of a cluster.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterTask {
    /// Write the member's pending pub-sub inserts/deletes to storage.
    ///
    /// The receiver flushes its own queues only and never re-broadcasts.
    FlushPendingItems,
}

impl ClusterTask {
    /// Encodes the task for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if `MsgPack` encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes a task received from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoded task.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
