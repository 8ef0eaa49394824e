//! Wire messages exchanged between Aerie nodes.

pub mod cluster;

pub use cluster::ClusterTask;
