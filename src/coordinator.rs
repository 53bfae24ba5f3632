/// Transaction coordinator for versioned object-store databases.
///
/// Creating a store requires reopening the database at a higher schema version.
/// If two callers did that concurrently, or one upgraded while another was
/// reading an existing store, they would race on the shared handle. The
/// coordinator owns one cached handle per database name and serializes opens:
///
/// - A store that already exists in the cached handle is served immediately.
/// - A missing store requested read-only fails `NotFound` without an upgrade.
/// - A missing store requested for writing triggers exactly one upgrade to
///   `version + 1`; callers queued behind it re-check after it completes.
/// - A handle made stale by another process upgrading the database is dropped
///   and transparently reopened.
use crate::error::{CacheError, CacheResult};
use crate::object_engine::{ObjectDatabase, ObjectEngine, SchemaUpgrade};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Lifecycle of a database handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    Closed,
    Opening,
    Open,
}

/// What the caller intends to do inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Serializes opens and schema upgrades per database name.
pub struct TransactionCoordinator {
    engine: Arc<dyn ObjectEngine>,
    handles: DashMap<String, Arc<dyn ObjectDatabase>>,
    states: DashMap<String, DatabaseState>,
    /// One FIFO lock per database; tokio's mutex grants waiters in order.
    open_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TransactionCoordinator {
    pub fn new(engine: Arc<dyn ObjectEngine>) -> Self {
        Self {
            engine,
            handles: DashMap::new(),
            states: DashMap::new(),
            open_locks: DashMap::new(),
        }
    }

    /// Current state of the handle for `db`.
    pub fn state(&self, db: &str) -> DatabaseState {
        self.states
            .get(db)
            .map(|s| *s)
            .unwrap_or(DatabaseState::Closed)
    }

    /// Schema version of the cached handle, if one is open.
    pub fn version(&self, db: &str) -> Option<u64> {
        self.handles.get(db).map(|h| h.version())
    }

    /// Drop the cached handle. The next transaction reopens it.
    pub fn invalidate(&self, db: &str) {
        if self.handles.remove(db).is_some() {
            debug!(db, "invalidated database handle");
        }
        self.states.insert(db.to_string(), DatabaseState::Closed);
    }

    /// A handle on `db` that contains `store`.
    pub async fn transaction(
        &self,
        db: &str,
        store: &str,
        mode: TransactionMode,
    ) -> CacheResult<Arc<dyn ObjectDatabase>> {
        if let Some(handle) = self.current_handle(db).await {
            if handle.has_store(store) {
                return Ok(handle);
            }
        }

        let lock = self.open_lock(db);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may have done the work already.
        let cached = self.current_handle(db).await;
        if let Some(handle) = &cached {
            if handle.has_store(store) {
                return Ok(handle.clone());
            }
        }

        self.states.insert(db.to_string(), DatabaseState::Opening);
        match self.open_for(db, store, mode, cached).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if !self.handles.contains_key(db) {
                    self.states.insert(db.to_string(), DatabaseState::Closed);
                }
                Err(err)
            }
        }
    }

    /// Every store currently in the database.
    pub async fn store_names(&self, db: &str) -> CacheResult<Vec<String>> {
        if let Some(handle) = self.current_handle(db).await {
            return Ok(handle.store_names());
        }
        let lock = self.open_lock(db);
        let _guard = lock.lock().await;
        if let Some(handle) = self.current_handle(db).await {
            return Ok(handle.store_names());
        }
        self.states.insert(db.to_string(), DatabaseState::Opening);
        match self.open_current(db).await {
            Ok(handle) => Ok(handle.store_names()),
            Err(err) => {
                self.states.insert(db.to_string(), DatabaseState::Closed);
                Err(err)
            }
        }
    }

    /// Delete the whole database and drop its handle.
    pub async fn delete_database(&self, db: &str) -> CacheResult<()> {
        let lock = self.open_lock(db);
        let _guard = lock.lock().await;
        self.invalidate(db);
        self.engine.delete_database(db).await
    }

    async fn open_for(
        &self,
        db: &str,
        store: &str,
        mode: TransactionMode,
        cached: Option<Arc<dyn ObjectDatabase>>,
    ) -> CacheResult<Arc<dyn ObjectDatabase>> {
        let handle = match cached {
            Some(handle) => handle,
            None => self.open_current(db).await?,
        };
        if handle.has_store(store) {
            return Ok(handle);
        }

        if mode == TransactionMode::ReadOnly {
            self.states.insert(db.to_string(), DatabaseState::Open);
            return Err(CacheError::collection_not_found(store));
        }

        let version = handle.version() + 1;
        debug!(db, store, version, "upgrading schema to create store");
        let upgraded = self
            .engine
            .open(db, Some(SchemaUpgrade::new(version, vec![store.to_string()])))
            .await
            .map_err(|e| {
                warn!(db, store, error = %e, "schema upgrade failed");
                into_store_unavailable(e)
            })?;
        self.cache(db, upgraded.clone());
        Ok(upgraded)
    }

    async fn open_current(&self, db: &str) -> CacheResult<Arc<dyn ObjectDatabase>> {
        let handle = self.engine.open(db, None).await.map_err(|e| {
            warn!(db, error = %e, "failed to open database");
            into_store_unavailable(e)
        })?;
        self.cache(db, handle.clone());
        Ok(handle)
    }

    fn cache(&self, db: &str, handle: Arc<dyn ObjectDatabase>) {
        self.handles.insert(db.to_string(), handle);
        self.states.insert(db.to_string(), DatabaseState::Open);
    }

    /// The cached handle, dropped first if another process moved the schema on.
    async fn current_handle(&self, db: &str) -> Option<Arc<dyn ObjectDatabase>> {
        let handle = self.handles.get(db).map(|h| h.value().clone())?;
        if handle.is_current().await {
            Some(handle)
        } else {
            debug!(db, version = handle.version(), "database changed externally");
            self.handles
                .remove_if(db, |_, cached| Arc::ptr_eq(cached, &handle));
            if !self.handles.contains_key(db) {
                self.states.insert(db.to_string(), DatabaseState::Closed);
            }
            None
        }
    }

    fn open_lock(&self, db: &str) -> Arc<Mutex<()>> {
        self.open_locks
            .entry(db.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn into_store_unavailable(err: CacheError) -> CacheError {
    match err {
        CacheError::StoreUnavailable(_) => err,
        other => CacheError::StoreUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::object_engine::FileObjectEngine;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir) -> Arc<TransactionCoordinator> {
        Arc::new(TransactionCoordinator::new(Arc::new(FileObjectEngine::new(
            dir.path(),
        ))))
    }

    #[tokio::test]
    async fn test_read_only_missing_store_does_not_upgrade() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);

        let err = coordinator
            .transaction("kid_app", "books", TransactionMode::ReadOnly)
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
        assert_eq!(coordinator.version("kid_app"), Some(1));
        assert_eq!(coordinator.state("kid_app"), DatabaseState::Open);
    }

    #[tokio::test]
    async fn test_write_creates_store_once() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        assert_eq!(coordinator.state("kid_app"), DatabaseState::Closed);

        let db = coordinator
            .transaction("kid_app", "books", TransactionMode::ReadWrite)
            .await
            .unwrap();
        assert_eq!(db.version(), 2);

        let again = coordinator
            .transaction("kid_app", "books", TransactionMode::ReadWrite)
            .await
            .unwrap();
        assert_eq!(again.version(), 2);
        assert_eq!(coordinator.state("kid_app"), DatabaseState::Open);
    }

    #[tokio::test]
    async fn test_concurrent_creators_share_one_upgrade() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);

        let a = coordinator.clone();
        let b = coordinator.clone();
        let (first, second) = tokio::join!(
            async move {
                let db = a
                    .transaction("kid_app", "books", TransactionMode::ReadWrite)
                    .await?;
                db.put_all("books", vec![Entity::with_id("b1")]).await
            },
            async move {
                let db = b
                    .transaction("kid_app", "books", TransactionMode::ReadWrite)
                    .await?;
                db.put_all("books", vec![Entity::with_id("b2")]).await
            }
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(coordinator.version("kid_app"), Some(2));
        let db = coordinator
            .transaction("kid_app", "books", TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(db.get_all("books").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_external_upgrade_invalidates_handle() {
        let dir = TempDir::new().unwrap();
        let ours = coordinator(&dir);
        let theirs = coordinator(&dir);

        ours.transaction("kid_app", "books", TransactionMode::ReadWrite)
            .await
            .unwrap();
        theirs
            .transaction("kid_app", "authors", TransactionMode::ReadWrite)
            .await
            .unwrap();
        assert_eq!(theirs.version("kid_app"), Some(3));

        // Our handle is at version 2 and does not know about "authors".
        let db = ours
            .transaction("kid_app", "authors", TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(db.version(), 3);
        assert!(db.has_store("books"));
    }

    #[tokio::test]
    async fn test_invalidate_and_delete() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        coordinator
            .transaction("kid_app", "books", TransactionMode::ReadWrite)
            .await
            .unwrap();

        coordinator.invalidate("kid_app");
        assert_eq!(coordinator.state("kid_app"), DatabaseState::Closed);
        assert_eq!(
            coordinator.store_names("kid_app").await.unwrap(),
            vec!["books".to_string()]
        );

        coordinator.delete_database("kid_app").await.unwrap();
        assert!(coordinator.store_names("kid_app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_to_existing_store_during_upgrades() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir);
        coordinator
            .transaction("kid_app", "books", TransactionMode::ReadWrite)
            .await
            .unwrap();

        let writer = |prefix: &'static str| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    let db = coordinator
                        .transaction("kid_app", "books", TransactionMode::ReadWrite)
                        .await?;
                    db.put_all("books", vec![Entity::with_id(format!("{}{}", prefix, i))])
                        .await?;
                }
                Ok::<_, CacheError>(())
            })
        };
        let upgrader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    coordinator
                        .transaction("kid_app", &format!("shelf{}", i), TransactionMode::ReadWrite)
                        .await?;
                }
                Ok::<_, CacheError>(())
            })
        };
        let (a, b) = (writer("a"), writer("b"));

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        upgrader.await.unwrap().unwrap();

        assert_eq!(coordinator.version("kid_app"), Some(27));
        let db = coordinator
            .transaction("kid_app", "books", TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(db.get_all("books").await.unwrap().len(), 50);
    }

    struct Unavailable;

    #[async_trait::async_trait]
    impl ObjectEngine for Unavailable {
        async fn open(
            &self,
            _db: &str,
            _upgrade: Option<SchemaUpgrade>,
        ) -> CacheResult<Arc<dyn ObjectDatabase>> {
            Err(CacheError::StoreUnavailable("disk gone".into()))
        }

        async fn delete_database(&self, _db: &str) -> CacheResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_open_resets_state() {
        let coordinator = TransactionCoordinator::new(Arc::new(Unavailable));

        assert!(coordinator.store_names("kid_app").await.is_err());
        assert_eq!(coordinator.state("kid_app"), DatabaseState::Closed);

        assert!(
            coordinator
                .transaction("kid_app", "books", TransactionMode::ReadWrite)
                .await
                .is_err()
        );
        assert_eq!(coordinator.state("kid_app"), DatabaseState::Closed);
    }
}
