//! Factory for opening a backend and exposing it through every provider seam.
//!
//! [`ProviderFactory`] turns a [`BackendConfig`] into [`Providers`]: one
//! store shared as the [`PubSubStore`], the [`UidProvider`], and the
//! [`PropertiesProvider`].

use std::sync::Arc;

#[cfg(feature = "redb")]
use std::path::PathBuf;

use tracing::info;

use crate::properties::PropertiesProvider;
use crate::sequence::UidProvider;
use crate::storage::datastores::MemoryStore;
use crate::storage::provider::PubSubStore;

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// Volatile in-process storage.
    Memory,
    /// Embedded redb database file.
    #[cfg(feature = "redb")]
    Redb { path: PathBuf },
    /// PostgreSQL server.
    #[cfg(feature = "postgres")]
    Postgres { url: String },
}

impl BackendConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            #[cfg(feature = "redb")]
            Self::Redb { .. } => "redb",
            #[cfg(feature = "postgres")]
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// The provider seams of one backend.
#[derive(Clone)]
pub struct Providers {
    pub pubsub: Arc<dyn PubSubStore>,
    pub uid: Arc<dyn UidProvider>,
    pub properties: Arc<dyn PropertiesProvider>,
}

impl Providers {
    /// Exposes a single store through all three seams.
    #[must_use]
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PubSubStore + UidProvider + PropertiesProvider + 'static,
    {
        Self {
            pubsub: backend.clone(),
            uid: backend.clone(),
            properties: backend,
        }
    }
}

/// Opens backends from configuration.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Opens the backend named by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened or connected to.
    pub async fn open(config: &BackendConfig) -> anyhow::Result<Providers> {
        let providers = match config {
            BackendConfig::Memory => Providers::from_backend(Arc::new(MemoryStore::new())),
            #[cfg(feature = "redb")]
            BackendConfig::Redb { path } => Providers::from_backend(Arc::new(
                crate::storage::datastores::RedbStore::open(path).await?,
            )),
            #[cfg(feature = "postgres")]
            BackendConfig::Postgres { url } => Providers::from_backend(Arc::new(
                crate::storage::datastores::PostgresStore::connect(url).await?,
            )),
        };
        info!(backend = config.kind(), "storage backend opened");
        Ok(providers)
    }
}
