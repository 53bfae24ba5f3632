/// Structured-storage engine with versioned schemas.
///
/// The engine mirrors the browser object-store model: a database has an integer
/// schema version and a set of named stores, and new stores can only be created
/// while opening the database at a higher version. [`FileObjectEngine`] keeps
/// each database in its own directory:
///
/// ```text
/// <root>/<database>/manifest.json   {"version": 3, "stores": ["books", "authors"]}
/// <root>/<database>/books.store.json  [{"id": "b1", ...}, ...]
/// ```
///
/// Every write goes to a uniquely named temporary file first and is renamed
/// into place, so a reader never observes a half-written store. Writes to the
/// same file are serialized by a lock owned by the engine and shared by every
/// handle it opens, including handles left behind by an upgrade.
use crate::entity::{Collection, Entity};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

const MANIFEST_FILE: &str = "manifest.json";

/// A schema change applied while opening a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaUpgrade {
    /// Version to open at. Must not be lower than the stored version.
    pub version: u64,
    /// Stores to create during the upgrade.
    pub create_stores: Vec<String>,
}

impl SchemaUpgrade {
    pub fn new(version: u64, create_stores: Vec<String>) -> Self {
        Self {
            version,
            create_stores,
        }
    }
}

/// Opens versioned databases.
#[async_trait]
pub trait ObjectEngine: Send + Sync {
    /// Open `db`, applying `upgrade` if given.
    ///
    /// Without an upgrade the current version is opened; a database that does
    /// not exist yet is created at version 1 with no stores.
    async fn open(
        &self,
        db: &str,
        upgrade: Option<SchemaUpgrade>,
    ) -> CacheResult<Arc<dyn ObjectDatabase>>;

    /// Delete the database and every store in it.
    async fn delete_database(&self, db: &str) -> CacheResult<()>;
}

/// An open database handle pinned to one schema version.
#[async_trait]
pub trait ObjectDatabase: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u64;

    fn store_names(&self) -> Vec<String>;

    fn has_store(&self, store: &str) -> bool {
        self.store_names().iter().any(|s| s == store)
    }

    /// False once the database was upgraded or deleted by another handle.
    async fn is_current(&self) -> bool;

    async fn get_all(&self, store: &str) -> CacheResult<Vec<Entity>>;

    async fn get(&self, store: &str, id: &str) -> CacheResult<Option<Entity>>;

    /// Upsert a batch in one write.
    async fn put_all(&self, store: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>>;

    async fn delete(&self, store: &str, id: &str) -> CacheResult<Option<Entity>>;

    /// Remove every entity from a store, keeping the store itself.
    async fn clear(&self, store: &str) -> CacheResult<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    version: u64,
    stores: BTreeSet<String>,
}

/// Per-file write locks, shared by every handle of one engine.
type WriteLocks = Arc<DashMap<PathBuf, Arc<Mutex<()>>>>;

fn write_lock(locks: &WriteLocks, path: &Path) -> Arc<Mutex<()>> {
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// File-backed [`ObjectEngine`].
#[derive(Debug, Clone)]
pub struct FileObjectEngine {
    root: PathBuf,
    write_locks: WriteLocks,
}

impl FileObjectEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when the root directory exists or can be created.
    pub fn is_usable(root: &Path) -> bool {
        std::fs::create_dir_all(root).is_ok()
    }

    fn database_dir(&self, db: &str) -> PathBuf {
        self.root.join(encode_file_stem(db))
    }
}

#[async_trait]
impl ObjectEngine for FileObjectEngine {
    async fn open(
        &self,
        db: &str,
        upgrade: Option<SchemaUpgrade>,
    ) -> CacheResult<Arc<dyn ObjectDatabase>> {
        let dir = self.database_dir(db);
        fs::create_dir_all(&dir).await.map_err(|e| {
            CacheError::StoreUnavailable(format!("cannot create database '{}': {}", db, e))
        })?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_lock = write_lock(&self.write_locks, &manifest_path);
        let _manifest = manifest_lock.lock().await;

        let existing = read_manifest(&dir).await?;
        let manifest = match (existing, upgrade) {
            (Some(current), None) => current,
            (None, None) => {
                let manifest = Manifest {
                    version: 1,
                    stores: BTreeSet::new(),
                };
                write_json(&manifest_path, &manifest).await?;
                debug!(db, version = 1, "created database");
                manifest
            }
            (current, Some(upgrade)) => {
                let mut manifest = current.unwrap_or_default();
                if upgrade.version < manifest.version {
                    return Err(CacheError::StoreUnavailable(format!(
                        "cannot open '{}' at version {}: already at version {}",
                        db, upgrade.version, manifest.version
                    )));
                }
                for store in &upgrade.create_stores {
                    let path = dir.join(store_file_name(store));
                    let lock = write_lock(&self.write_locks, &path);
                    let _store = lock.lock().await;
                    if !fs::try_exists(&path).await.unwrap_or(false) {
                        write_json(&path, &Collection::new()).await?;
                    }
                    manifest.stores.insert(store.clone());
                }
                manifest.version = upgrade.version;
                write_json(&manifest_path, &manifest).await?;
                debug!(db, version = manifest.version, stores = ?upgrade.create_stores, "upgraded database");
                manifest
            }
        };

        Ok(Arc::new(FileDatabase {
            name: db.to_string(),
            dir,
            version: manifest.version,
            stores: manifest.stores,
            write_locks: self.write_locks.clone(),
        }))
    }

    async fn delete_database(&self, db: &str) -> CacheResult<()> {
        let dir = self.database_dir(db);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(db, "deleted database");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::StoreUnavailable(format!(
                "cannot delete database '{}': {}",
                db, e
            ))),
        }
    }
}

struct FileDatabase {
    name: String,
    dir: PathBuf,
    version: u64,
    stores: BTreeSet<String>,
    /// Read-modify-write transactions on a store run one at a time across
    /// every handle of the engine.
    write_locks: WriteLocks,
}

impl FileDatabase {
    fn store_path(&self, store: &str) -> CacheResult<PathBuf> {
        if !self.stores.contains(store) {
            return Err(CacheError::collection_not_found(store));
        }
        Ok(self.dir.join(store_file_name(store)))
    }

    fn store_lock(&self, store: &str) -> CacheResult<Arc<Mutex<()>>> {
        Ok(write_lock(&self.write_locks, &self.store_path(store)?))
    }

    async fn load(&self, store: &str) -> CacheResult<Collection> {
        let path = self.store_path(store)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Collection::new()),
            Err(e) => Err(CacheError::StoreUnavailable(format!(
                "cannot read store '{}': {}",
                store, e
            ))),
        }
    }
}

#[async_trait]
impl ObjectDatabase for FileDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.iter().cloned().collect()
    }

    fn has_store(&self, store: &str) -> bool {
        self.stores.contains(store)
    }

    async fn is_current(&self) -> bool {
        match read_manifest(&self.dir).await {
            Ok(Some(manifest)) => manifest.version == self.version,
            _ => false,
        }
    }

    async fn get_all(&self, store: &str) -> CacheResult<Vec<Entity>> {
        Ok(self.load(store).await?.into_entities())
    }

    async fn get(&self, store: &str, id: &str) -> CacheResult<Option<Entity>> {
        Ok(self.load(store).await?.get(id).cloned())
    }

    async fn put_all(&self, store: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>> {
        let lock = self.store_lock(store)?;
        let _tx = lock.lock().await;
        let mut collection = self.load(store).await?;
        let saved: Vec<Entity> = entities
            .into_iter()
            .map(|entity| collection.upsert(entity))
            .collect();
        write_json(&self.store_path(store)?, &collection).await?;
        trace!(db = %self.name, store, count = saved.len(), "put_all");
        Ok(saved)
    }

    async fn delete(&self, store: &str, id: &str) -> CacheResult<Option<Entity>> {
        let lock = self.store_lock(store)?;
        let _tx = lock.lock().await;
        let mut collection = self.load(store).await?;
        let removed = collection.remove(id);
        if removed.is_some() {
            write_json(&self.store_path(store)?, &collection).await?;
        }
        Ok(removed)
    }

    async fn clear(&self, store: &str) -> CacheResult<()> {
        let lock = self.store_lock(store)?;
        let _tx = lock.lock().await;
        write_json(&self.store_path(store)?, &Collection::new()).await
    }
}

async fn read_manifest(dir: &Path) -> CacheResult<Option<Manifest>> {
    match fs::read(dir.join(MANIFEST_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            CacheError::StoreUnavailable(format!("corrupt manifest: {}", e))
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::StoreUnavailable(format!(
            "cannot read manifest: {}",
            e
        ))),
    }
}

/// Write JSON to a unique file next to `path` and rename it into place.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> CacheResult<()> {
    let bytes = serde_json::to_vec(value)?;
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| CacheError::StoreUnavailable(format!("failed to write file: {}", e)))?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::StoreUnavailable(format!(
            "failed to rename file: {}",
            e
        )));
    }
    Ok(())
}

fn store_file_name(store: &str) -> String {
    format!("{}.store.json", encode_file_stem(store))
}

/// Percent-encode anything that is not safe in a file name.
pub(crate) fn encode_file_stem(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entity(value: serde_json::Value) -> Entity {
        Entity::from_json(value).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_version_one() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());

        let db = engine.open("kid_app", None).await.unwrap();
        assert_eq!(db.version(), 1);
        assert!(db.store_names().is_empty());
        assert!(db.is_current().await);
    }

    #[tokio::test]
    async fn test_upgrade_creates_store() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());
        let v1 = engine.open("kid_app", None).await.unwrap();

        let v2 = engine
            .open("kid_app", Some(SchemaUpgrade::new(2, vec!["books".into()])))
            .await
            .unwrap();
        assert_eq!(v2.version(), 2);
        assert!(v2.has_store("books"));
        assert!(!v1.is_current().await);
        assert!(v2.is_current().await);

        let reopened = engine.open("kid_app", None).await.unwrap();
        assert_eq!(reopened.version(), 2);
        assert_eq!(reopened.store_names(), vec!["books".to_string()]);
    }

    #[tokio::test]
    async fn test_lower_version_fails() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());
        engine
            .open("kid_app", Some(SchemaUpgrade::new(3, vec![])))
            .await
            .unwrap();

        let err = engine
            .open("kid_app", Some(SchemaUpgrade::new(2, vec!["books".into()])))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_store_operations() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());
        let db = engine
            .open("kid_app", Some(SchemaUpgrade::new(2, vec!["books".into()])))
            .await
            .unwrap();

        db.put_all(
            "books",
            vec![
                entity(json!({"id": "b1", "title": "Dune"})),
                entity(json!({"id": "b2", "title": "Emma"})),
            ],
        )
        .await
        .unwrap();
        assert_eq!(db.get_all("books").await.unwrap().len(), 2);
        assert_eq!(
            db.get("books", "b2").await.unwrap().unwrap().get("title"),
            Some(&json!("Emma"))
        );

        let removed = db.delete("books", "b1").await.unwrap();
        assert!(removed.is_some());
        assert!(db.delete("books", "b1").await.unwrap().is_none());

        db.clear("books").await.unwrap();
        assert!(db.get_all("books").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_store_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());
        let db = engine.open("kid_app", None).await.unwrap();

        let err = db.get_all("books").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_database() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());
        let db = engine.open("kid_app", None).await.unwrap();

        engine.delete_database("kid_app").await.unwrap();
        assert!(!db.is_current().await);
        engine.delete_database("kid_app").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_handle_writes_are_serialized() {
        let dir = TempDir::new().unwrap();
        let engine = FileObjectEngine::new(dir.path());
        let before = engine
            .open("kid_app", Some(SchemaUpgrade::new(2, vec!["books".into()])))
            .await
            .unwrap();
        let after = engine
            .open("kid_app", Some(SchemaUpgrade::new(3, vec!["authors".into()])))
            .await
            .unwrap();

        let writes = (0..40).map(|i| {
            let db = if i % 2 == 0 { before.clone() } else { after.clone() };
            async move {
                db.put_all("books", vec![entity(json!({"id": format!("b{}", i)}))])
                    .await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(after.get_all("books").await.unwrap().len(), 40);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("kid_app"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_encode_file_stem() {
        assert_eq!(encode_file_stem("books"), "books");
        assert_eq!(encode_file_stem("../etc"), "%2E%2E%2Fetc");
    }
}
