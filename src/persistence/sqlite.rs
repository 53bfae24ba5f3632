/// SQLite adapter.
///
/// One database file per logical database, one table per collection. SQLite
/// cannot cheaply tell us which tables are collections, so a reserved master
/// table records them. Rows keep their `rowid` on upsert, which preserves
/// insertion order for `find`.
use super::{Adapter, RemoveResult, StorageProvider, provider_dir};
use crate::config::SyncConfig;
use crate::entity::{Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

const MASTER_TABLE: &str = "_collections";

const MASTER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _collections (
    name TEXT PRIMARY KEY NOT NULL
);
"#;

pub struct SqliteAdapter {
    database: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAdapter {
    /// Open `<data_dir>/sqlite/<database>.sqlite3`.
    pub fn open(config: &SyncConfig) -> CacheResult<Self> {
        let dir = provider_dir(config, StorageProvider::Sqlite).ok_or_else(|| {
            CacheError::StoreUnavailable("sqlite needs a data directory".to_string())
        })?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{}.sqlite3",
            crate::object_engine::encode_file_stem(config.database())
        ));
        Self::open_path(config.database(), &path)
    }

    pub fn open_path(database: impl Into<String>, path: &Path) -> CacheResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            CacheError::StoreUnavailable(format!(
                "failed to open sqlite database at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::with_connection(database, conn)
    }

    pub fn open_in_memory(database: impl Into<String>) -> CacheResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_error)?;
        Self::with_connection(database, conn)
    }

    fn with_connection(database: impl Into<String>, conn: Connection) -> CacheResult<Self> {
        let database = database.into();
        validate_name("database", &database)?;
        conn.execute_batch(MASTER_SCHEMA).map_err(store_error)?;
        debug!(database = %database, "opened sqlite adapter");
        Ok(Self {
            database,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn is_supported(config: &SyncConfig) -> bool {
        provider_dir(config, StorageProvider::Sqlite)
            .map(|dir| std::fs::create_dir_all(dir).is_ok())
            .unwrap_or(false)
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CacheResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| CacheError::StoreUnavailable(format!("lock poisoned: {}", e)))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| CacheError::StoreUnavailable(format!("sqlite task failed: {}", e)))?
    }
}

fn store_error(err: rusqlite::Error) -> CacheError {
    CacheError::StoreUnavailable(err.to_string())
}

fn table_name(collection: &str) -> String {
    format!("\"c_{}\"", collection.replace('"', "\"\""))
}

fn collection_exists(conn: &Connection, collection: &str) -> CacheResult<bool> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE name = ?1", MASTER_TABLE),
        params![collection],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(store_error)
}

fn parse_row(value: String) -> CacheResult<Entity> {
    Entity::from_json(serde_json::from_str(&value)?)
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Sqlite
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn find(&self, collection: &str) -> CacheResult<Vec<Entity>> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            if !collection_exists(conn, &collection)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT value FROM {} ORDER BY rowid",
                    table_name(&collection)
                ))
                .map_err(store_error)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(store_error)?;
            let mut entities = Vec::new();
            for row in rows {
                entities.push(parse_row(row.map_err(store_error)?)?);
            }
            Ok(entities)
        })
        .await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> CacheResult<Entity> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            if !collection_exists(conn, &collection)? {
                return Err(CacheError::entity_not_found(collection, id));
            }
            let value: Option<String> = conn
                .query_row(
                    &format!("SELECT value FROM {} WHERE key = ?1", table_name(&collection)),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_error)?;
            match value {
                Some(value) => parse_row(value),
                None => Err(CacheError::entity_not_found(collection, id)),
            }
        })
        .await
    }

    async fn save(&self, collection: &str, entities: Vec<Entity>) -> CacheResult<Vec<Entity>> {
        validate_name("collection", collection)?;
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(store_error)?;
            let table = table_name(&collection);
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);",
                table
            ))
            .map_err(store_error)?;
            tx.execute(
                &format!("INSERT OR IGNORE INTO {} (name) VALUES (?1)", MASTER_TABLE),
                params![collection],
            )
            .map_err(store_error)?;

            let mut saved = Vec::with_capacity(entities.len());
            {
                let mut stmt = tx
                    .prepare(&format!(
                        "INSERT INTO {} (key, value) VALUES (?1, ?2) \
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        table
                    ))
                    .map_err(store_error)?;
                for mut entity in entities {
                    let id = entity.ensure_id();
                    let value = serde_json::to_string(&entity)?;
                    stmt.execute(params![id, value]).map_err(store_error)?;
                    saved.push(entity);
                }
            }
            tx.commit().map_err(store_error)?;
            trace!(collection = %collection, count = saved.len(), "sqlite save");
            Ok(saved)
        })
        .await
    }

    async fn remove_by_id(&self, collection: &str, id: &str) -> CacheResult<RemoveResult> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.with_conn(move |conn| {
            if !collection_exists(conn, &collection)? {
                return Err(CacheError::entity_not_found(collection, id));
            }
            let tx = conn.transaction().map_err(store_error)?;
            let table = table_name(&collection);
            let value: Option<String> = tx
                .query_row(
                    &format!("SELECT value FROM {} WHERE key = ?1", table),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_error)?;
            let Some(value) = value else {
                return Err(CacheError::entity_not_found(collection, id));
            };
            tx.execute(&format!("DELETE FROM {} WHERE key = ?1", table), params![id])
                .map_err(store_error)?;
            tx.commit().map_err(store_error)?;
            Ok(RemoveResult::single(parse_row(value)?))
        })
        .await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(store_error)?;
            let names: Vec<String> = {
                let mut stmt = tx
                    .prepare(&format!("SELECT name FROM {}", MASTER_TABLE))
                    .map_err(store_error)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(store_error)?;
                rows.collect::<Result<_, _>>().map_err(store_error)?
            };
            for name in &names {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", table_name(name)))
                    .map_err(store_error)?;
            }
            tx.execute(&format!("DELETE FROM {}", MASTER_TABLE), [])
                .map_err(store_error)?;
            tx.commit().map_err(store_error)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn book(id: &str, title: &str) -> Entity {
        Entity::from_json(json!({"id": id, "title": title})).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_keeps_insertion_order() {
        let adapter = SqliteAdapter::open_in_memory("kid_app").unwrap();
        adapter
            .save("books", vec![book("b1", "Dune"), book("b2", "Emma")])
            .await
            .unwrap();
        adapter.save("books", vec![book("b1", "Dune Messiah")]).await.unwrap();

        let books = adapter.find("books").await.unwrap();
        let ids: Vec<_> = books.iter().map(|b| b.id().unwrap()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
        assert_eq!(books[0].get("title"), Some(&json!("Dune Messiah")));
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let adapter = SqliteAdapter::open_in_memory("kid_app").unwrap();
        assert!(adapter.find("books").await.unwrap().is_empty());
        assert!(adapter.find_by_id("books", "b1").await.unwrap_err().is_not_found());
        assert!(adapter.remove_by_id("books", "b1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_quoted_collection_name() {
        let adapter = SqliteAdapter::open_in_memory("kid_app").unwrap();
        adapter
            .save("odd \"name\"", vec![book("b1", "Dune")])
            .await
            .unwrap();
        assert_eq!(adapter.find("odd \"name\"").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_clear() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::new("kid_app").with_data_dir(dir.path());
        let adapter = SqliteAdapter::open(&config).unwrap();
        adapter.save("books", vec![book("b1", "Dune")]).await.unwrap();
        adapter.save("authors", vec![book("a1", "Herbert")]).await.unwrap();

        let reopened = SqliteAdapter::open(&config).unwrap();
        assert_eq!(reopened.find("authors").await.unwrap().len(), 1);

        reopened.clear().await.unwrap();
        assert!(reopened.find("books").await.unwrap().is_empty());
        assert!(reopened.find("authors").await.unwrap().is_empty());
    }
}
