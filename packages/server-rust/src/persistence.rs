//! Wiring of the persistence services on top of one backend.

use std::sync::Arc;

use tracing::info;

use crate::cluster::{ClusterMessenger, StandaloneCluster};
use crate::config::PubSubConfig;
use crate::properties::ServerProperties;
use crate::pubsub::PubSubPersistence;
use crate::sequence::SequenceManager;
use crate::storage::{BackendConfig, ProviderFactory, Providers};

/// Properties, pub-sub persistence, and id allocation over one backend.
pub struct PersistenceLayer {
    pub properties: Arc<ServerProperties>,
    pub pubsub: Arc<PubSubPersistence>,
    pub sequences: Arc<SequenceManager>,
}

impl PersistenceLayer {
    /// Opens `backend` and builds the services as a standalone node.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened or its properties
    /// cannot be loaded.
    pub async fn open(backend: &BackendConfig) -> anyhow::Result<Self> {
        let providers = ProviderFactory::open(backend).await?;
        Self::from_providers(providers, Arc::new(StandaloneCluster)).await
    }

    /// Builds the services from already opened providers.
    ///
    /// The pub-sub configuration is read from the stored properties.
    ///
    /// # Errors
    ///
    /// Returns an error if the properties cannot be loaded.
    pub async fn from_providers(
        providers: Providers,
        cluster: Arc<dyn ClusterMessenger>,
    ) -> anyhow::Result<Self> {
        let properties = Arc::new(ServerProperties::load(providers.properties).await?);
        let config = PubSubConfig::from_properties(&properties);
        info!(
            max_items_flush = config.max_items_flush,
            max_rows_fetch = config.max_rows_fetch,
            "pub-sub persistence configured"
        );

        let pubsub =
            Arc::new(PubSubPersistence::new(providers.pubsub, config).with_cluster(cluster));
        let sequences = Arc::new(SequenceManager::new(providers.uid));
        Ok(Self {
            properties,
            pubsub,
            sequences,
        })
    }

    /// Starts the periodic timers. Returns `false` if already started.
    pub fn start(&self) -> bool {
        self.pubsub.start_timers()
    }

    /// Stops the timers and writes everything still pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush or purge fails.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.pubsub.shutdown().await?;
        Ok(())
    }
}
