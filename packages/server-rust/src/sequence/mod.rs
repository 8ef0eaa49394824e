//! Block-based unique id allocation.

pub mod manager;
pub mod provider;

pub use manager::{SequenceManager, CONTENTION_BACKOFF, MAX_BLOCK_ATTEMPTS};
pub use provider::UidProvider;
