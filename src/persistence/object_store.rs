/// Object-store adapter.
///
/// Each collection is a store in a versioned object-store database. Store
/// creation needs a schema upgrade, so every access goes through the
/// [`TransactionCoordinator`].
use super::{Adapter, RemoveResult, StorageProvider, provider_dir};
use crate::config::SyncConfig;
use crate::coordinator::{TransactionCoordinator, TransactionMode};
use crate::entity::{Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use crate::object_engine::FileObjectEngine;
use async_trait::async_trait;
use std::sync::Arc;

pub struct ObjectStoreAdapter {
    database: String,
    coordinator: Arc<TransactionCoordinator>,
}

impl ObjectStoreAdapter {
    pub fn new(
        database: impl Into<String>,
        coordinator: Arc<TransactionCoordinator>,
    ) -> CacheResult<Self> {
        let database = database.into();
        validate_name("database", &database)?;
        Ok(Self {
            database,
            coordinator,
        })
    }

    /// Open over a [`FileObjectEngine`] in the configured data directory.
    pub fn open(config: &SyncConfig) -> CacheResult<Self> {
        let root = provider_dir(config, StorageProvider::ObjectStore).ok_or_else(|| {
            CacheError::StoreUnavailable("object store needs a data directory".to_string())
        })?;
        let engine = Arc::new(FileObjectEngine::new(root));
        Self::new(
            config.database(),
            Arc::new(TransactionCoordinator::new(engine)),
        )
    }

    pub fn is_supported(config: &SyncConfig) -> bool {
        provider_dir(config, StorageProvider::ObjectStore)
            .map(|root| FileObjectEngine::is_usable(&root))
            .unwrap_or(false)
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }
}

#[async_trait]
impl Adapter for ObjectStoreAdapter {
    fn provider(&self) -> StorageProvider {
        StorageProvider::ObjectStore
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn find(&self, collection: &str) -> CacheResult<Vec<Entity>> {
        match self
            .coordinator
            .transaction(&self.database, collection, TransactionMode::ReadOnly)
            .await
        {
            Ok(db) => db.get_all(collection).await,
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> CacheResult<Entity> {
        let db = self
            .coordinator
            .transaction(&self.database, collection, TransactionMode::ReadOnly)
            .await
            .map_err(|err| not_found_entity(err, collection, id))?;
        db.get(collection, id)
            .await?
            .ok_or_else(|| CacheError::entity_not_found(collection, id))
    }

    async fn save(&self, collection: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>> {
        validate_name("collection", collection)?;
        let db = self
            .coordinator
            .transaction(&self.database, collection, TransactionMode::ReadWrite)
            .await?;
        db.put_all(collection, entities).await
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> CacheResult<RemoveResult> {
        // A missing store has nothing to remove, so never upgrade for it.
        let db = self
            .coordinator
            .transaction(&self.database, collection, TransactionMode::ReadOnly)
            .await
            .map_err(|err| not_found_entity(err, collection, id))?;
        db.delete(collection, id)
            .await?
            .map(RemoveResult::single)
            .ok_or_else(|| CacheError::entity_not_found(collection, id))
    }

    async fn clear(&self) -> CacheResult<()> {
        self.coordinator.delete_database(&self.database).await
    }
}

fn not_found_entity(err: CacheError, collection: &str, id: &str) -> CacheError {
    if err.is_not_found() {
        CacheError::entity_not_found(collection, id)
    } else {
        err
    }
}
