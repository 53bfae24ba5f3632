/// Flat key-value adapter.
///
/// The substrate only offers `get`/`set`/`remove` of whole values, so each
/// collection is stored as one JSON blob and every access reads or rewrites the
/// whole collection. A reserved master key lists the collections of a database
/// because the substrate cannot enumerate keys.
///
/// Key layout for database `kid_app`:
///
/// ```text
/// kid_app.master       ["books", "authors"]
/// kid_app.c.books      [{"id": "b1", ...}]
/// ```
///
/// Database and collection names are percent-encoded into the key, so `.`
/// only ever appears as a separator.
use super::{Adapter, RemoveResult, StorageProvider, provider_dir};
use crate::config::SyncConfig;
use crate::entity::{Collection, Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use crate::object_engine::encode_file_stem;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::trace;

/// Whole-value string store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> CacheResult<()>;

    async fn remove(&self, key: &str) -> CacheResult<()>;
}

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.kv", encode_file_stem(key)))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::StoreUnavailable(format!(
                "cannot read key '{}': {}",
                key, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: String) -> CacheResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(key);
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp_path, value).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Adapter over any [`KeyValueStore`].
pub struct KeyValueAdapter {
    database: String,
    store: Arc<dyn KeyValueStore>,
    /// Single FIFO queue for every operation on this adapter.
    queue: Mutex<()>,
}

impl KeyValueAdapter {
    pub fn new(database: impl Into<String>, store: Arc<dyn KeyValueStore>) -> CacheResult<Self> {
        let database = database.into();
        validate_name("database", &database)?;
        Ok(Self {
            database,
            store,
            queue: Mutex::new(()),
        })
    }

    pub fn open(config: &SyncConfig) -> CacheResult<Self> {
        let dir = provider_dir(config, StorageProvider::KeyValue).ok_or_else(|| {
            CacheError::StoreUnavailable("key-value store needs a data directory".to_string())
        })?;
        Self::new(config.database(), Arc::new(FileKeyValueStore::new(dir)))
    }

    pub fn is_supported(config: &SyncConfig) -> bool {
        provider_dir(config, StorageProvider::KeyValue)
            .map(|dir| std::fs::create_dir_all(dir).is_ok())
            .unwrap_or(false)
    }

    fn master_key(&self) -> String {
        format!("{}.master", encode_file_stem(&self.database))
    }

    fn collection_key(&self, collection: &str) -> String {
        format!(
            "{}.c.{}",
            encode_file_stem(&self.database),
            encode_file_stem(collection)
        )
    }

    async fn load_master(&self) -> CacheResult<BTreeSet<String>> {
        match self.store.get(&self.master_key()).await? {
            Some(blob) => Ok(serde_json::from_str(&blob)?),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn load(&self, collection: &str) -> CacheResult<Option<Collection>> {
        match self.store.get(&self.collection_key(collection)).await? {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    async fn store_collection(&self, collection: &str, entities: &Collection) -> CacheResult<()> {
        self.store
            .set(
                &self.collection_key(collection),
                serde_json::to_string(entities)?,
            )
            .await
    }
}

#[async_trait]
impl Adapter for KeyValueAdapter {
    fn provider(&self) -> StorageProvider {
        StorageProvider::KeyValue
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn find(&self, collection: &str) -> CacheResult<Vec<Entity>> {
        let _queued = self.queue.lock().await;
        Ok(self
            .load(collection)
            .await?
            .map(Collection::into_entities)
            .unwrap_or_default())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> CacheResult<Entity> {
        let _queued = self.queue.lock().await;
        self.load(collection)
            .await?
            .and_then(|c| c.get(id).cloned())
            .ok_or_else(|| CacheError::entity_not_found(collection, id))
    }

    async fn save(&self, collection: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>> {
        validate_name("collection", collection)?;
        let _queued = self.queue.lock().await;

        let existing = self.load(collection).await?;
        let is_new = existing.is_none();
        let mut target = existing.unwrap_or_default();
        let saved: Vec<Entity> = entities.into_iter().map(|e| target.upsert(e)).collect();
        self.store_collection(collection, &target).await?;

        if is_new {
            let mut master = self.load_master().await?;
            if master.insert(collection.to_string()) {
                self.store
                    .set(&self.master_key(), serde_json::to_string(&master)?)
                    .await?;
            }
        }
        trace!(collection, count = saved.len(), "key-value save");
        Ok(saved)
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> CacheResult<RemoveResult> {
        let _queued = self.queue.lock().await;
        let mut target = self
            .load(collection)
            .await?
            .ok_or_else(|| CacheError::entity_not_found(collection, id))?;
        let removed = target
            .remove(id)
            .ok_or_else(|| CacheError::entity_not_found(collection, id))?;
        self.store_collection(collection, &target).await?;
        Ok(RemoveResult::single(removed))
    }

    async fn remove_many(&self, collection: &str, ids: &[String]) -> CacheResult<RemoveResult> {
        let _queued = self.queue.lock().await;
        let mut result = RemoveResult::default();
        let Some(mut target) = self.load(collection).await? else {
            return Ok(result);
        };
        for id in ids {
            if let Some(removed) = target.remove(id) {
                result.extend(RemoveResult::single(removed));
            }
        }
        if result.count > 0 {
            self.store_collection(collection, &target).await?;
        }
        Ok(result)
    }

    async fn clear(&self) -> CacheResult<()> {
        let _queued = self.queue.lock().await;
        for collection in self.load_master().await? {
            self.store.remove(&self.collection_key(&collection)).await?;
        }
        self.store.remove(&self.master_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn adapter(dir: &TempDir) -> KeyValueAdapter {
        KeyValueAdapter::open(&SyncConfig::new("kid_app").with_data_dir(dir.path())).unwrap()
    }

    #[tokio::test]
    async fn test_save_registers_collection_in_master() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir);
        adapter
            .save("books", vec![Entity::with_id("b1")])
            .await
            .unwrap();
        adapter
            .save("authors", vec![Entity::with_id("a1")])
            .await
            .unwrap();

        let master = adapter.load_master().await.unwrap();
        assert_eq!(
            master.into_iter().collect::<Vec<_>>(),
            vec!["authors".to_string(), "books".to_string()]
        );
    }

    #[tokio::test]
    async fn test_clear_removes_every_collection() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir);
        adapter
            .save("books", vec![Entity::with_id("b1")])
            .await
            .unwrap();
        adapter.clear().await.unwrap();

        assert!(adapter.find("books").await.unwrap().is_empty());
        assert!(adapter.load_master().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_many_skips_missing() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir);
        adapter
            .save(
                "books",
                vec![
                    Entity::from_json(json!({"id": "b1", "n": 1})).unwrap(),
                    Entity::from_json(json!({"id": "b2", "n": 2})).unwrap(),
                ],
            )
            .await
            .unwrap();

        let removed = adapter
            .remove_many("books", &["b2".to_string(), "zz".to_string()])
            .await
            .unwrap();
        assert_eq!(removed.count, 1);
        assert_eq!(adapter.find("books").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dotted_names_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(dir.path()));
        let dotted = KeyValueAdapter::new("a.c", store.clone()).unwrap();
        let plain = KeyValueAdapter::new("a", store).unwrap();
        assert_ne!(dotted.master_key(), plain.collection_key("_master"));
        assert_ne!(dotted.master_key(), plain.collection_key("master"));

        dotted
            .save("books", vec![Entity::with_id("b1")])
            .await
            .unwrap();
        plain
            .save("_master", vec![Entity::with_id("m1")])
            .await
            .unwrap();
        plain
            .save("master", vec![Entity::with_id("m2")])
            .await
            .unwrap();

        assert_eq!(
            dotted.load_master().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["books".to_string()]
        );
        assert_eq!(dotted.find("books").await.unwrap().len(), 1);
        assert_eq!(plain.find("_master").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path());
        assert_eq!(store.get("absent").await.unwrap(), None);
        store.remove("absent").await.unwrap();
        store.set("k", "v".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
