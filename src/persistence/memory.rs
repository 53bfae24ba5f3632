/// In-memory adapter.
///
/// Collections live as long as the adapter. All operations go through a single
/// fair async mutex, so each read-modify-write completes before the next queued
/// operation starts.
use super::{Adapter, RemoveResult, StorageProvider};
use crate::config::SyncConfig;
use crate::entity::{Collection, Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::trace;

pub struct MemoryAdapter {
    database: String,
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryAdapter {
    pub fn new(database: impl Into<String>) -> CacheResult<Self> {
        let database = database.into();
        validate_name("database", &database)?;
        Ok(Self {
            database,
            collections: Mutex::new(HashMap::new()),
        })
    }

    /// Memory is always available.
    pub fn is_supported(_config: &SyncConfig) -> bool {
        true
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Memory
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn find(&self, collection: &str) -> CacheResult<Vec<Entity>> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|c| c.entities().to_vec())
            .unwrap_or_default())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> CacheResult<Entity> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
            .ok_or_else(|| CacheError::entity_not_found(collection, id))
    }

    async fn save(&self, collection: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>> {
        validate_name("collection", collection)?;
        let mut collections = self.collections.lock().await;
        let target = collections.entry(collection.to_string()).or_default();
        let saved: Vec<Entity> = entities.into_iter().map(|e| target.upsert(e)).collect();
        trace!(collection, count = saved.len(), "memory save");
        Ok(saved)
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> CacheResult<RemoveResult> {
        let mut collections = self.collections.lock().await;
        collections
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .map(RemoveResult::single)
            .ok_or_else(|| CacheError::entity_not_found(collection, id))
    }

    async fn remove_many(&self, collection: &str, ids: &[String]) -> CacheResult<RemoveResult> {
        let mut collections = self.collections.lock().await;
        let mut result = RemoveResult::default();
        if let Some(target) = collections.get_mut(collection) {
            for id in ids {
                if let Some(removed) = target.remove(id) {
                    result.extend(RemoveResult::single(removed));
                }
            }
        }
        Ok(result)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.collections.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn book(id: &str, title: &str) -> Entity {
        Entity::from_json(json!({"id": id, "title": title})).unwrap()
    }

    #[tokio::test]
    async fn test_find_missing_collection_is_empty() {
        let adapter = MemoryAdapter::new("kid_app").unwrap();
        assert!(adapter.find("books").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_find_by_id() {
        let adapter = MemoryAdapter::new("kid_app").unwrap();
        adapter
            .save("books", vec![book("b1", "Dune"), book("b2", "Emma")])
            .await
            .unwrap();

        let found = adapter.find_by_id("books", "b2").await.unwrap();
        assert_eq!(found.get("title"), Some(&json!("Emma")));
        assert!(adapter.find_by_id("books", "b3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_absent_leaves_store_unchanged() {
        let adapter = MemoryAdapter::new("kid_app").unwrap();
        adapter.save("books", vec![book("b1", "Dune")]).await.unwrap();

        let err = adapter.remove_by_id("books", "nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(adapter.find("books").await.unwrap(), vec![book("b1", "Dune")]);

        let removed = adapter.remove_by_id("books", "b1").await.unwrap();
        assert_eq!(removed.count, 1);
        assert!(adapter.find("books").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_saves_do_not_lose_updates() {
        let adapter = Arc::new(MemoryAdapter::new("kid_app").unwrap());
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    adapter
                        .save("books", vec![book(&format!("b{i}"), "t")])
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(adapter.find("books").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_clear() {
        let adapter = MemoryAdapter::new("kid_app").unwrap();
        adapter.save("books", vec![book("b1", "Dune")]).await.unwrap();
        adapter.clear().await.unwrap();
        assert!(adapter.find("books").await.unwrap().is_empty());
    }
}
