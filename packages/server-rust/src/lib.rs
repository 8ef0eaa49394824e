//! Aerie server: write-back persistence of pub-sub items, block-based id
//! allocation, server properties, and the storage backends behind them.

pub mod cluster;
pub mod config;
pub mod error;
pub mod persistence;
pub mod properties;
pub mod pubsub;
pub mod sequence;
pub mod storage;

pub use config::PubSubConfig;
pub use error::{PersistenceError, SequenceError};
pub use persistence::PersistenceLayer;
pub use properties::{PropertiesProvider, ServerProperties};
pub use pubsub::PubSubPersistence;
pub use sequence::{SequenceManager, UidProvider};
pub use storage::{BackendConfig, ItemCache, ProviderFactory, Providers, PubSubStore};
