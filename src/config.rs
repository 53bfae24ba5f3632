/// Configuration for a delta-cache client.
///
/// Everything has a default so `SyncConfig::default()` yields a working
/// in-memory client; file-backed adapters need `data_dir`, the network rack
/// needs `base_url` and `app_key`.
use crate::error::{CacheError, CacheResult};
use crate::persistence::StorageProvider;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default backend base URL.
pub const DEFAULT_BASE_URL: &str = "https://baas.example.com";

/// Default request timeout (60 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of ids re-fetched per delta-set batch request.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Application key used in backend paths and channel names.
    pub app_key: String,
    /// Backend base URL (scheme + host, no trailing slash needed).
    pub base_url: String,
    /// Logical database name; defaults to the app key when empty.
    pub database_name: String,
    /// Directory for file-backed adapters. `None` leaves only memory storage.
    pub data_dir: Option<PathBuf>,
    /// Storage providers in preference order.
    pub storage: Vec<StorageProvider>,
    /// Per-request timeout.
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
    /// Ids per delta-set re-fetch request.
    pub batch_size: usize,
    /// Identifier of this device for realtime registration.
    pub device_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            database_name: String::new(),
            data_dir: None,
            storage: StorageProvider::preference_order().to_vec(),
            default_timeout: DEFAULT_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            device_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl SyncConfig {
    /// Create a configuration for an app key with defaults elsewhere.
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            ..Self::default()
        }
    }

    /// Set the backend base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the database name.
    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    /// Set the directory used by file-backed adapters.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Replace the storage preference list.
    pub fn with_storage(mut self, storage: Vec<StorageProvider>) -> Self {
        self.storage = storage;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the delta-set batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the device identifier.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// The effective database name.
    pub fn database(&self) -> &str {
        if self.database_name.is_empty() {
            &self.app_key
        } else {
            &self.database_name
        }
    }

    /// Default data directory under the platform data dir.
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("delta-cache"))
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            CacheError::InvalidArgument(format!(
                "cannot read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: SyncConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise fail deep inside a request.
    pub fn validate(&self) -> CacheResult<()> {
        if self.batch_size == 0 {
            return Err(CacheError::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.storage.is_empty() {
            return Err(CacheError::InvalidArgument(
                "at least one storage provider is required".to_string(),
            ));
        }
        url::Url::parse(&self.base_url).map_err(|e| {
            CacheError::InvalidArgument(format!("invalid base url '{}': {}", self.base_url, e))
        })?;
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new("kid_app");
        assert_eq!(config.database(), "kid_app");
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.storage.first(), Some(&StorageProvider::ObjectStore));
        assert_eq!(config.storage.last(), Some(&StorageProvider::Memory));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_name_override() {
        let config = SyncConfig::new("kid_app").with_database_name("offline");
        assert_eq!(config.database(), "offline");
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = SyncConfig::new("kid_app").with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"appKey": "kid_app", "baseUrl": "http://localhost:9000", "storage": ["memory"], "defaultTimeout": 2500}}"#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.app_key, "kid_app");
        assert_eq!(config.storage, vec![StorageProvider::Memory]);
        assert_eq!(config.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }
}
