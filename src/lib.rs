//! # delta-cache: offline cache and delta sync for JSON collections
//!
//! delta-cache keeps a local copy of server-owned JSON collections and keeps
//! it fresh cheaply:
//! - **Pluggable local storage** - object store, SQLite, key-value files or
//!   memory, picked once at start-up
//! - **Request racks** - every cache and network call passes through an
//!   ordered list of stages
//! - **Delta-set pulls** - only entities whose `lastModifiedAt` changed are
//!   downloaded again
//! - **Live updates** - pushed entities land in the cache before receivers
//!   see them
//!
//! ## Quick Start
//!
//! ```ignore
//! use delta_cache::{Entity, Filter, Query, SyncClient, SyncConfig, json};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::new("kid_app").with_data_dir("/tmp/delta-cache");
//!     let client = SyncClient::start(config).await?;
//!     let books = client.collection("books")?;
//!
//!     // Work offline
//!     books.save(Entity::from_json(json!({"id": "b1", "title": "Dune"}))?).await?;
//!     let cached = books.find(&Query::new().filter(Filter::eq("title", "Dune"))).await?;
//!
//!     // Catch up with the backend
//!     let pulled = books.pull(&Query::new().sort_by("title", true).limit(50)).await?;
//!     println!("{} cached, {} re-fetched", cached.len(), pulled.refetched_ids.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Client** (`core`) - [`SyncClient`] and per-collection handles
//! 2. **Racks** (`rack`) - the cache rack `[Cache]` and the network rack
//!    `[Serialize, Http, Parse]`
//! 3. **Persistence** (`persistence`) - the [`Adapter`] backends, with the
//!    transaction coordinator in front of the object store
//! 4. **Reconciliation** (`reconciliation`) - delta-set pulls
//! 5. **Live** (`live`) - realtime registration and push routing
//!
//! ## Thread Safety
//!
//! A `SyncClient` is cheap to clone and every component is `Send + Sync`:
//!
//! ```ignore
//! let client = SyncClient::offline(SyncConfig::new("kid_app")).await?;
//! let books = client.collection("books")?;
//!
//! tokio::spawn(async move {
//!     books.save(Entity::with_id("b2")).await.unwrap();
//! });
//! ```

// Internal modules
mod core;
mod error;

pub mod config;
pub mod entity;
pub mod query;
pub mod request;

// Local storage
pub mod coordinator;
pub mod object_engine;
pub mod persistence;

// Pipelines and the network
pub mod rack;
pub mod transport;

pub mod live;
pub mod reconciliation;

// Public API exports
pub use crate::core::{CollectionHandle, SyncClient};
pub use config::SyncConfig;
pub use entity::{Entity, Metadata};
pub use error::{CacheError, CacheResult, ErrorKind};
pub use request::{Body, Headers, Method, Request, Response};

// Query exports
pub use query::{Aggregation, Filter, Query, QueryExecutor, QueryResult, SortBy, SortOrder};

// Storage exports
pub use persistence::{Adapter, RemoveResult, StorageProvider};

// Rack and transport exports
pub use rack::{CancelHandle, Endpoint, Rack, Stage};
#[cfg(feature = "http")]
pub use transport::ReqwestTransport;
pub use transport::{Transport, TransportError, TransportRequest, TransportResponse};

pub use live::{ActiveUser, LiveService, LiveState, PubSubConfig, Receiver};
pub use reconciliation::{DeltaSetReconciler, PullResult};

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use delta_cache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::core::{CollectionHandle, SyncClient};
    pub use crate::entity::{Entity, Metadata};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::query::{Aggregation, Filter, Query, SortBy, SortOrder};
    pub use serde_json::{Value as JsonValue, json};

    pub use crate::live::{ActiveUser, LiveState, Receiver};
    pub use crate::persistence::StorageProvider;
    pub use crate::reconciliation::PullResult;
}
