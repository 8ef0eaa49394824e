//! Server properties: named string settings persisted by the backend.
//!
//! [`ServerProperties`] keeps every property in memory and writes changes
//! through to a [`PropertiesProvider`]. Names are dotted paths such as
//! `xmpp.pubsub.flush.max`; removing a name also removes every name that
//! starts with it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Durable storage for server properties.
#[async_trait]
pub trait PropertiesProvider: Send + Sync {
    /// Loads all stored properties.
    async fn load_properties(&self) -> anyhow::Result<HashMap<String, String>>;

    async fn insert_property(&self, name: &str, value: &str) -> anyhow::Result<()>;

    /// Overwrites an existing property. Missing names are left absent.
    async fn update_property(&self, name: &str, value: &str) -> anyhow::Result<()>;

    /// Deletes `name` and every property whose name starts with it.
    async fn delete_property(&self, name: &str) -> anyhow::Result<()>;
}

/// Write-through view of the stored properties.
pub struct ServerProperties {
    provider: Arc<dyn PropertiesProvider>,
    values: RwLock<HashMap<String, String>>,
}

impl ServerProperties {
    /// Loads every stored property from `provider`.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the properties cannot be read.
    pub async fn load(provider: Arc<dyn PropertiesProvider>) -> anyhow::Result<Self> {
        let values = provider.load_properties().await?;
        debug!(count = values.len(), "loaded server properties");
        Ok(Self {
            provider,
            values: RwLock::new(values),
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    /// Parses `name`, falling back to `default` when it is absent or malformed.
    pub fn get_parsed<T: FromStr>(&self, name: &str, default: T) -> T {
        let Some(raw) = self.get(name) else {
            return default;
        };
        match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(property = name, value = %raw, "ignoring malformed property value");
                default
            }
        }
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get_parsed(name, default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get_parsed(name, default)
    }

    /// Sets `name` to `value`, inserting or updating the stored row.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the in-memory value is left unchanged.
    pub async fn set(&self, name: &str, value: &str) -> anyhow::Result<()> {
        let exists = self.values.read().contains_key(name);
        if exists {
            self.provider.update_property(name, value).await?;
        } else {
            self.provider.insert_property(name, value).await?;
        }
        self.values.write().insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Removes `name` and every property nested under it.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the in-memory values are left unchanged.
    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.provider.delete_property(name).await?;
        self.values.write().retain(|key, _| !key.starts_with(name));
        Ok(())
    }

    /// Names of all properties, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.read().keys().cloned().collect();
        names.sort();
        names
    }
}
