//! Storage layer for published items.
//!
//! - [`PubSubStore`]: durable item storage written through in batches
//! - [`ItemCache`]: in-memory cache in front of it
//! - [`datastores`]: concrete backends
//! - [`factory`]: builds a backend bundle from configuration

pub mod cache;
pub mod datastores;
pub mod factory;
pub mod provider;

pub use cache::{CacheGuard, ItemCache, LocalItemCache, ITEM_CACHE_NAME};
pub use factory::{BackendConfig, ProviderFactory, Providers};
pub use provider::{FlushBatch, PubSubStore, RetentionPolicy};
