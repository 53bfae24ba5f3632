/// Client facade over the cache, the backend and live updates.
///
/// This module provides the main user-facing API. A [`SyncClient`] owns the
/// persistence adapter picked at start-up, the cache rack in front of it, the
/// network rack to the backend and, optionally, the live update service.
/// Every collection operation goes through the cache rack; only `pull` talks
/// to the backend.
///
/// # Design Philosophy
///
/// - **One start-up decision**: the storage provider is chosen once and never
///   re-probed
/// - **Cheap to share**: clones share every component through `Arc`
/// - **Same path for every write**: saves, pulls and pushes all land in the
///   cache through the cache rack
use crate::config::SyncConfig;
use crate::entity::{Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use crate::live::{HttpRealtimeBackend, LiveService, PubSubConnector, RealtimeBackend};
use crate::persistence::{self, Adapter, RemoveResult, StorageProvider};
use crate::query::{Aggregation, Query};
use crate::rack::cache::{COUNT_ID, GROUP_ID};
use crate::rack::{Endpoint, Rack};
use crate::reconciliation::{DeltaSetReconciler, PullResult};
use crate::request::{Body, Request};
use crate::transport::Transport;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::info;

/// The sync client.
///
/// # Thread Safety
///
/// `SyncClient` can be cloned cheaply to share across tasks.
///
/// # Example
///
/// ```ignore
/// use delta_cache::{Entity, Query, SyncClient, SyncConfig, json};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = SyncClient::start(SyncConfig::new("kid_app")).await?;
///     let books = client.collection("books")?;
///
///     books.save(Entity::from_json(json!({"id": "b1", "title": "Dune"}))?).await?;
///     let pulled = books.pull(&Query::new().limit(20)).await?;
///     println!("{} books", pulled.entities.len());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SyncClient {
    config: Arc<SyncConfig>,
    adapter: Arc<dyn Adapter>,
    cache: Arc<Rack>,
    network: Option<Arc<Rack>>,
    live: Option<Arc<LiveService>>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("app_key", &self.config.app_key)
            .field("database", &self.config.database())
            .field("provider", &self.adapter.provider())
            .field("online", &self.network.is_some())
            .field("live", &self.live.is_some())
            .finish()
    }
}

impl SyncClient {
    /// Start a client that talks to `config.base_url` over HTTP.
    #[cfg(feature = "http")]
    pub async fn start(config: SyncConfig) -> CacheResult<Self> {
        Self::with_transport(config, Arc::new(crate::transport::ReqwestTransport::new())).await
    }

    /// Start a client whose network rack uses `transport`.
    pub async fn with_transport(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
    ) -> CacheResult<Self> {
        let mut client = Self::offline(config).await?;
        let endpoint = Endpoint::new(&client.config.base_url, &client.config.app_key);
        client.network = Some(Arc::new(Rack::network(transport, endpoint)));
        Ok(client)
    }

    /// Start a client with a cache only; `pull` and live updates are
    /// unavailable.
    pub async fn offline(config: SyncConfig) -> CacheResult<Self> {
        config.validate()?;
        validate_name("app key", &config.app_key)?;
        let adapter = persistence::open_adapter(&config)?;
        info!(
            app_key = %config.app_key,
            database = %config.database(),
            provider = %adapter.provider(),
            "sync client started"
        );
        Ok(Self::from_adapter(config, adapter))
    }

    /// Build a client around an already opened adapter.
    pub fn from_adapter(config: SyncConfig, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            cache: Arc::new(Rack::cache(adapter.clone())),
            config: Arc::new(config),
            adapter,
            network: None,
            live: None,
        }
    }

    /// Enable live updates, registering through the backend's user
    /// endpoints and connecting through `connector`.
    pub fn with_live(self, connector: Arc<dyn PubSubConnector>) -> CacheResult<Self> {
        let network = self.network()?.clone();
        let backend = HttpRealtimeBackend::new(network, &self.config.app_key)
            .with_timeout(self.config.default_timeout);
        Ok(self.with_live_backend(Arc::new(backend), connector))
    }

    /// Enable live updates with a custom registration backend.
    pub fn with_live_backend(
        mut self,
        backend: Arc<dyn RealtimeBackend>,
        connector: Arc<dyn PubSubConnector>,
    ) -> Self {
        let service = LiveService::new(
            &self.config.app_key,
            &self.config.device_id,
            backend,
            connector,
        )
        .with_cache(self.cache.clone());
        self.live = Some(Arc::new(service));
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn provider(&self) -> StorageProvider {
        self.adapter.provider()
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn cache_rack(&self) -> &Arc<Rack> {
        &self.cache
    }

    fn network(&self) -> CacheResult<&Arc<Rack>> {
        self.network.as_ref().ok_or_else(|| {
            CacheError::NetworkUnreachable("client was started offline".to_string())
        })
    }

    /// The live update service.
    pub fn live(&self) -> CacheResult<Arc<LiveService>> {
        self.live.clone().ok_or_else(|| {
            CacheError::InvalidArgument("live updates are not enabled".to_string())
        })
    }

    /// A handle for one collection.
    pub fn collection(&self, name: &str) -> CacheResult<CollectionHandle> {
        validate_name("collection", name)?;
        Ok(CollectionHandle {
            client: self.clone(),
            name: name.to_string(),
        })
    }

    /// Remove every cached collection.
    pub async fn clear(&self) -> CacheResult<()> {
        self.adapter.clear().await?;
        info!(database = %self.config.database(), "cache cleared");
        Ok(())
    }
}

/// Operations on one named collection.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    client: SyncClient,
    name: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn cache(&self, request: Request) -> CacheResult<JsonValue> {
        Ok(self.client.cache.execute(&request).await?.data)
    }

    /// Cached entities matching `query`.
    pub async fn find(&self, query: &Query) -> CacheResult<Vec<Entity>> {
        let request = Request::get(&self.name).with_query(query.clone());
        crate::entity::entities_from_json(self.cache(request).await?)
    }

    pub async fn find_by_id(&self, id: &str) -> CacheResult<Entity> {
        let request = Request::get(&self.name).with_id(id);
        Entity::from_json(self.cache(request).await?)
    }

    /// Upsert one entity; it gets an id if it has none.
    pub async fn save(&self, entity: Entity) -> CacheResult<Entity> {
        let request = Request::put(&self.name).with_body(Body::One(entity));
        Entity::from_json(self.cache(request).await?)
    }

    /// Upsert several entities as one unit.
    pub async fn save_many(&self, entities: Vec<Entity>) -> CacheResult<Vec<Entity>> {
        let request = Request::put(&self.name).with_body(Body::Many(entities));
        crate::entity::entities_from_json(self.cache(request).await?)
    }

    pub async fn remove_by_id(&self, id: &str) -> CacheResult<RemoveResult> {
        let request = Request::delete(&self.name).with_id(id);
        Ok(serde_json::from_value(self.cache(request).await?)?)
    }

    /// Remove every cached entity matching `query`.
    pub async fn remove(&self, query: &Query) -> CacheResult<RemoveResult> {
        let request = Request::delete(&self.name).with_query(query.clone());
        Ok(serde_json::from_value(self.cache(request).await?)?)
    }

    pub async fn count(&self, query: &Query) -> CacheResult<usize> {
        let request = Request::get(&self.name)
            .with_id(COUNT_ID)
            .with_query(query.clone());
        let data = self.cache(request).await?;
        data.get("count")
            .and_then(JsonValue::as_u64)
            .map(|count| count as usize)
            .ok_or_else(|| CacheError::InvalidArgument(format!("malformed count: {}", data)))
    }

    /// Aggregate the cached entities matching `query`.
    pub async fn group(&self, aggregation: Aggregation, query: &Query) -> CacheResult<JsonValue> {
        let request = Request::get(&self.name)
            .with_id(GROUP_ID)
            .with_query(query.clone().aggregate(aggregation));
        self.cache(request).await
    }

    /// Refresh the cache from the backend and return the windowed result.
    pub async fn pull(&self, query: &Query) -> CacheResult<PullResult> {
        let network = self.client.network()?.clone();
        DeltaSetReconciler::new(self.client.cache.clone(), network)
            .with_batch_size(self.client.config.batch_size)
            .with_timeout(self.client.config.default_timeout)
            .pull(&self.name, query)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use serde_json::json;

    async fn client() -> SyncClient {
        SyncClient::offline(SyncConfig::new("kid_app")).await.unwrap()
    }

    fn book(id: &str, year: i64) -> Entity {
        Entity::from_json(json!({"id": id, "year": year})).unwrap()
    }

    #[tokio::test]
    async fn test_offline_client_uses_memory() {
        let client = client().await;
        assert_eq!(client.provider(), StorageProvider::Memory);
        let books = client.collection("books").unwrap();
        assert!(matches!(
            books.pull(&Query::new()).await.unwrap_err(),
            CacheError::NetworkUnreachable(_)
        ));
        assert!(client.live().is_err());
    }

    #[tokio::test]
    async fn test_collection_round_trip() {
        let books = client().await.collection("books").unwrap();
        books
            .save_many(vec![book("a", 1965), book("b", 1984), book("c", 2001)])
            .await
            .unwrap();

        let recent = books
            .find(&Query::new().filter(Filter::gt("year", 1970)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(books.count(&Query::new()).await.unwrap(), 3);

        let total = books
            .group(Aggregation::sum("year"), &Query::new())
            .await
            .unwrap();
        assert_eq!(total, json!(5950.0));

        let removed = books.remove_by_id("a").await.unwrap();
        assert_eq!(removed.count, 1);
        assert!(books.find_by_id("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_save_generates_id() {
        let books = client().await.collection("books").unwrap();
        let saved = books
            .save(Entity::from_json(json!({"title": "Dune"})).unwrap())
            .await
            .unwrap();
        assert!(saved.id().is_some());
    }

    #[tokio::test]
    async fn test_clear() {
        let client = client().await;
        let books = client.collection("books").unwrap();
        books.save(book("a", 1)).await.unwrap();
        client.clear().await.unwrap();
        assert!(books.find(&Query::new()).await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_collection_name() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = runtime.block_on(client());
        assert!(client.collection("").is_err());
    }
}
