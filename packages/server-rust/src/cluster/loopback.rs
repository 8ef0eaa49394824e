//! Messengers that need no network.
//!
//! [`StandaloneCluster`] is the single-node default: clustering is off and
//! broadcasts reach nobody. [`LoopbackCluster`] connects several engines in
//! one process; every task is encoded and decoded on its way to a member so
//! the wire format is exercised exactly as a networked cluster would.

use std::sync::{Arc, Weak};

use aerie_core::ClusterTask;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::traits::{ClusterMessenger, ClusterTaskHandler};

/// Messenger for a node that is not part of a cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneCluster;

#[async_trait]
impl ClusterMessenger for StandaloneCluster {
    fn is_clustering_enabled(&self) -> bool {
        false
    }

    async fn broadcast(&self, _task: ClusterTask) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Member {
    id: String,
    handler: Option<Weak<dyn ClusterTaskHandler>>,
}

/// In-process cluster of [`LoopbackMember`]s.
#[derive(Default)]
pub struct LoopbackCluster {
    members: RwLock<Vec<Member>>,
}

impl LoopbackCluster {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a member and returns its messenger.
    ///
    /// The member receives tasks once a handler is attached with
    /// [`LoopbackMember::attach`].
    #[must_use]
    pub fn join(self: &Arc<Self>, member_id: impl Into<String>) -> Arc<LoopbackMember> {
        let member_id = member_id.into();
        self.members.write().push(Member {
            id: member_id.clone(),
            handler: None,
        });
        Arc::new(LoopbackMember {
            cluster: Arc::clone(self),
            member_id,
        })
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    fn attach(&self, member_id: &str, handler: Weak<dyn ClusterTaskHandler>) {
        let mut members = self.members.write();
        if let Some(member) = members.iter_mut().find(|m| m.id == member_id) {
            member.handler = Some(handler);
        }
    }

    fn handlers_except(&self, member_id: &str) -> Vec<(String, Arc<dyn ClusterTaskHandler>)> {
        self.members
            .read()
            .iter()
            .filter(|m| m.id != member_id)
            .filter_map(|m| {
                let handler = m.handler.as_ref()?.upgrade()?;
                Some((m.id.clone(), handler))
            })
            .collect()
    }
}

/// One member's view of a [`LoopbackCluster`].
pub struct LoopbackMember {
    cluster: Arc<LoopbackCluster>,
    member_id: String,
}

impl LoopbackMember {
    #[must_use]
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Registers the handler that runs tasks sent to this member.
    ///
    /// Only a weak reference is kept; a dropped handler stops receiving.
    pub fn attach<H: ClusterTaskHandler + 'static>(&self, handler: &Arc<H>) {
        let handler: Arc<dyn ClusterTaskHandler> = handler.clone();
        self.cluster.attach(&self.member_id, Arc::downgrade(&handler));
    }
}

#[async_trait]
impl ClusterMessenger for LoopbackMember {
    fn is_clustering_enabled(&self) -> bool {
        self.cluster.member_count() > 1
    }

    async fn broadcast(&self, task: ClusterTask) -> anyhow::Result<()> {
        let bytes = task.to_bytes().context("failed to encode cluster task")?;
        let targets = self.cluster.handlers_except(&self.member_id);
        debug!(from = %self.member_id, ?task, targets = targets.len(), "broadcasting cluster task");

        let mut failed = 0usize;
        for (member_id, handler) in &targets {
            let result = match ClusterTask::from_bytes(&bytes) {
                Ok(decoded) => handler.handle_task(decoded).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(member = %member_id, error = %e, "cluster task failed on member");
                failed += 1;
            }
        }

        if failed > 0 {
            anyhow::bail!("{failed} of {} members failed to run {task:?}", targets.len());
        }
        Ok(())
    }
}
