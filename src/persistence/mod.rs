/// Local persistence adapters.
///
/// Every backend implements the same [`Adapter`] contract over a different
/// substrate. The backend is picked once at start-up by [`open_adapter`], which
/// walks the configured preference list and takes the first provider whose
/// support probe passes.
///
/// | Provider | Substrate |
/// |---|---|
/// | [`StorageProvider::ObjectStore`] | versioned object-store engine behind the transaction coordinator |
/// | [`StorageProvider::Sqlite`] | embedded SQLite, one table per collection |
/// | [`StorageProvider::KeyValue`] | flat key-value files, one blob per collection |
/// | [`StorageProvider::Memory`] | in-process map, lives as long as the adapter |
///
/// # Example
///
/// ```ignore
/// let adapter = persistence::open_adapter(&SyncConfig::new("kid_app"))?;
/// adapter.save("books", vec![book]).await?;
/// let books = adapter.find("books").await?;
/// ```
pub mod key_value;
pub mod memory;
pub mod object_store;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use key_value::{FileKeyValueStore, KeyValueAdapter, KeyValueStore};
pub use memory::MemoryAdapter;
pub use object_store::ObjectStoreAdapter;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

use crate::config::SyncConfig;
use crate::entity::{Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// A storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageProvider {
    ObjectStore,
    Sqlite,
    KeyValue,
    Memory,
}

const PREFERENCE_ORDER: [StorageProvider; 4] = [
    StorageProvider::ObjectStore,
    StorageProvider::Sqlite,
    StorageProvider::KeyValue,
    StorageProvider::Memory,
];

impl StorageProvider {
    /// All providers, most capable first.
    pub fn preference_order() -> &'static [StorageProvider] {
        &PREFERENCE_ORDER
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::ObjectStore => "object-store",
            StorageProvider::Sqlite => "sqlite",
            StorageProvider::KeyValue => "key-value",
            StorageProvider::Memory => "memory",
        }
    }

    /// Whether this provider can run with `config` in this build.
    pub fn is_supported(&self, config: &SyncConfig) -> bool {
        match self {
            StorageProvider::ObjectStore => ObjectStoreAdapter::is_supported(config),
            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => SqliteAdapter::is_supported(config),
            #[cfg(not(feature = "sqlite"))]
            StorageProvider::Sqlite => false,
            StorageProvider::KeyValue => KeyValueAdapter::is_supported(config),
            StorageProvider::Memory => MemoryAdapter::is_supported(config),
        }
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageProvider {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        PREFERENCE_ORDER
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CacheError::InvalidArgument(format!("unknown storage provider '{}'", s)))
    }
}

/// Outcome of a removal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveResult {
    pub count: usize,
    pub entities: Vec<Entity>,
}

impl RemoveResult {
    pub fn single(entity: Entity) -> Self {
        Self {
            count: 1,
            entities: vec![entity],
        }
    }

    pub fn extend(&mut self, other: RemoveResult) {
        self.count += other.count;
        self.entities.extend(other.entities);
    }
}

/// Uniform collection store over one database.
///
/// `save` is an upsert keyed by id and a batch is visible to `find` either
/// completely or not at all.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn provider(&self) -> StorageProvider;

    /// Name of the database this adapter is bound to.
    fn database(&self) -> &str;

    /// Every entity in `collection`, in insertion order. Empty when the
    /// collection does not exist.
    async fn find(&self, collection: &str) -> CacheResult<Vec<Entity>>;

    async fn find_by_id(&self, collection: &str, id: &str) -> CacheResult<Entity>;

    /// Upsert `entities`, generating ids where missing.
    async fn save(&self, collection: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>>;

    /// Remove one entity. Fails `NotFound` and leaves the store unchanged
    /// when the id is absent.
    async fn remove_by_id(&self, collection: &str, id: &str) -> CacheResult<RemoveResult>;

    /// Remove several entities, skipping ids that are already gone.
    async fn remove_many(&self, collection: &str, ids: &[String]) -> CacheResult<RemoveResult> {
        let mut result = RemoveResult::default();
        for id in ids {
            match self.remove_by_id(collection, id).await {
                Ok(removed) => result.extend(removed),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }

    /// Drop every collection in the database.
    async fn clear(&self) -> CacheResult<()>;
}

/// Open the first supported provider from `config.storage`.
pub fn open_adapter(config: &SyncConfig) -> CacheResult<Arc<dyn Adapter>> {
    let database = config.database();
    validate_name("database", database)?;

    for provider in &config.storage {
        if !provider.is_supported(config) {
            debug!(%provider, "storage provider not supported");
            continue;
        }
        let adapter: Arc<dyn Adapter> = match provider {
            StorageProvider::ObjectStore => Arc::new(ObjectStoreAdapter::open(config)?),
            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => Arc::new(SqliteAdapter::open(config)?),
            #[cfg(not(feature = "sqlite"))]
            StorageProvider::Sqlite => continue,
            StorageProvider::KeyValue => Arc::new(KeyValueAdapter::open(config)?),
            StorageProvider::Memory => Arc::new(MemoryAdapter::new(database)?),
        };
        info!(%provider, database, "opened storage adapter");
        return Ok(adapter);
    }

    Err(CacheError::StoreUnavailable(format!(
        "none of the configured storage providers is supported: {}",
        config
            .storage
            .iter()
            .map(StorageProvider::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Directory for a provider's files under the configured data directory.
pub(crate) fn provider_dir(config: &SyncConfig, provider: StorageProvider) -> Option<std::path::PathBuf> {
    config
        .data_dir
        .as_ref()
        .map(|dir| dir.join(provider.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_provider_names_round_trip() {
        for provider in StorageProvider::preference_order() {
            assert_eq!(provider.as_str().parse::<StorageProvider>().unwrap(), *provider);
        }
        assert!("indexeddb".parse::<StorageProvider>().is_err());
    }

    #[test]
    fn test_without_data_dir_falls_back_to_memory() {
        let config = SyncConfig::new("kid_app");
        let adapter = open_adapter(&config).unwrap();
        assert_eq!(adapter.provider(), StorageProvider::Memory);
    }

    #[test]
    fn test_prefers_object_store_with_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::new("kid_app").with_data_dir(dir.path());
        let adapter = open_adapter(&config).unwrap();
        assert_eq!(adapter.provider(), StorageProvider::ObjectStore);
        assert_eq!(adapter.database(), "kid_app");
    }

    #[test]
    fn test_honors_configured_order() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::new("kid_app")
            .with_data_dir(dir.path())
            .with_storage(vec![StorageProvider::KeyValue, StorageProvider::Memory]);
        let adapter = open_adapter(&config).unwrap();
        assert_eq!(adapter.provider(), StorageProvider::KeyValue);
    }

    #[test]
    fn test_empty_database_name_fails_fast() {
        let config = SyncConfig::new("");
        assert!(matches!(
            open_adapter(&config).err(),
            Some(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_no_supported_provider() {
        let config = SyncConfig::new("kid_app").with_storage(vec![StorageProvider::KeyValue]);
        assert!(matches!(
            open_adapter(&config).err(),
            Some(CacheError::StoreUnavailable(_))
        ));
    }
}
