/// Error types for delta-cache operations.
///
/// Every fallible operation in the crate returns `CacheResult<T>`. The variants
/// map one-to-one onto the failure kinds callers are expected to branch on:
/// missing data, programmer mistakes, unavailable stores, network trouble,
/// server rejections and state-machine violations.
use thiserror::Error;

/// The main error type for delta-cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The requested entity or collection does not exist.
    #[error("{}", not_found_message(.collection, .id.as_deref()))]
    NotFound {
        /// Collection that was queried
        collection: String,
        /// Entity id, when the lookup was by id
        id: Option<String>,
    },

    /// Malformed input: bad collection name, non-object headers, a receiver with
    /// no callbacks, and similar programmer errors. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A persistence backend failed to open, upgrade or write its handle.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// DNS or connect failure reaching the backend.
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The transport did not answer within the request timeout.
    #[error("Request timed out after {millis}ms")]
    Timeout {
        /// The timeout that elapsed
        millis: u64,
    },

    /// The backend answered with a non-success status.
    #[error("Server rejected request ({status} {name}): {description}")]
    ServerRejected {
        /// HTTP status code
        status: u16,
        /// Error name from the backend body
        name: String,
        /// Human-readable description
        description: String,
        /// Extra debugging detail, often empty
        debug: String,
    },

    /// `execute` was called on a request that is already executing.
    #[error("Request is already executing")]
    AlreadyInFlight,

    /// The live update channel is already registered (or registering).
    #[error("Live service is already registered")]
    AlreadyRegistered,

    /// The live update channel is not registered.
    #[error("Live service is not registered")]
    NotRegistered,

    /// The in-flight operation was cancelled through its rack.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn not_found_message(collection: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("Entity '{}' not found in collection '{}'", id, collection),
        None => format!("Collection '{}' not found", collection),
    }
}

/// Coarse classification of a [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    StoreUnavailable,
    NetworkUnreachable,
    Timeout,
    ServerRejected,
    AlreadyInFlight,
    AlreadyRegistered,
    NotRegistered,
    Cancelled,
    Serialization,
}

impl CacheError {
    /// Build a `NotFound` for a whole collection.
    pub fn collection_not_found(collection: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: None,
        }
    }

    /// Build a `NotFound` for a single entity.
    pub fn entity_not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: Some(id.into()),
        }
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::NotFound { .. } => ErrorKind::NotFound,
            CacheError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CacheError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            CacheError::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
            CacheError::Timeout { .. } => ErrorKind::Timeout,
            CacheError::ServerRejected { .. } => ErrorKind::ServerRejected,
            CacheError::AlreadyInFlight => ErrorKind::AlreadyInFlight,
            CacheError::AlreadyRegistered => ErrorKind::AlreadyRegistered,
            CacheError::NotRegistered => ErrorKind::NotRegistered,
            CacheError::Cancelled => ErrorKind::Cancelled,
            CacheError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// True for failures a layer above this crate may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::NetworkUnreachable(_) | CacheError::Timeout { .. }
        )
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for delta-cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
