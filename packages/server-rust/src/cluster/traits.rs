//! Cluster seams used by the persistence engine.
//!
//! The engine only needs two things from a cluster: to know whether one is
//! active, and to deliver a [`ClusterTask`] to every other member and wait
//! for them to run it. Membership and transport live behind
//! [`ClusterMessenger`].

use aerie_core::ClusterTask;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// ClusterMessenger
// ---------------------------------------------------------------------------

/// Outbound side of the cluster.
#[async_trait]
pub trait ClusterMessenger: Send + Sync {
    /// Returns `true` if this node is part of an active cluster.
    fn is_clustering_enabled(&self) -> bool;

    /// Runs `task` on every other member and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if any member failed to run the task.
    async fn broadcast(&self, task: ClusterTask) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ClusterTaskHandler
// ---------------------------------------------------------------------------

/// Inbound side of the cluster: runs tasks received from other members.
#[async_trait]
pub trait ClusterTaskHandler: Send + Sync {
    async fn handle_task(&self, task: ClusterTask) -> anyhow::Result<()>;
}
