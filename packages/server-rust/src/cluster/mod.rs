//! Cluster coordination for the persistence engine.
//!
//! Provides the messenger and handler traits, a single-node messenger, and
//! an in-process loopback cluster that carries tasks in their wire encoding.

pub mod loopback;
pub mod traits;

pub use loopback::{LoopbackCluster, LoopbackMember, StandaloneCluster};
pub use traits::{ClusterMessenger, ClusterTaskHandler};
