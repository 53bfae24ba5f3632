/// Delta-set reconciliation of a local collection against the backend.
///
/// Instead of downloading a whole collection, a pull asks the backend only for
/// the `{id, metadata}` headers of the entities matching the query's filter,
/// compares their `lastModifiedAt` with the cached copies and re-fetches the
/// entities that differ.
///
/// ## The Protocol
///
/// 1. **Local read**: run the filter against the cache rack. A missing
///    collection counts as empty.
/// 2. **Remote headers**: run the same filter against the network rack with a
///    projection of `id` and `metadata` and no paging, so the comparison is
///    exhaustive.
/// 3. **Delta**: same timestamp string means unchanged; anything else, and
///    every id only the server has, is re-fetched. Ids only the cache has are
///    dropped from the result.
/// 4. **Re-fetch**: ids go out in batches of at most `batch_size`, as
///    independent concurrent requests. Results are concatenated in issue order.
///    Batches run under the caller's [`CancelHandle`] rather than as rack
///    dispatches, so cancelling the network rack does not reach them.
/// 5. **Persist**: the re-fetched entities are bulk-saved to the cache before
///    the pull returns.
/// 6. **Window**: re-fetched and unchanged entities are combined and the
///    query's sort, skip, limit and projection are applied. The filter is not
///    re-applied.
///
/// Network failures in steps 2 and 4 propagate unchanged; a pull never returns
/// partial data.
///
/// ## Example
///
/// ```rust,ignore
/// let reconciler = DeltaSetReconciler::new(cache_rack, network_rack);
/// let result = reconciler.pull("books", &Query::new().limit(20)).await?;
/// println!("{} entities, {} re-fetched", result.entities.len(), result.refetched_ids.len());
/// ```
pub mod delta;

pub use delta::{DeltaSet, compute_delta};

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_TIMEOUT};
use crate::entity::{Entity, ID_FIELD, METADATA_FIELD, validate_name};
use crate::error::CacheResult;
use crate::query::{Filter, Query};
use crate::rack::{CancelHandle, Rack};
use crate::request::{Body, Headers, Request, Response};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a pull.
#[derive(Debug, Clone, Default)]
pub struct PullResult {
    /// Re-fetched and still-valid entities, windowed by the query.
    pub entities: Vec<Entity>,
    /// Headers of the header request merged with every batch response.
    pub headers: Headers,
    /// Ids that were re-fetched, in request order.
    pub refetched_ids: Vec<String>,
    /// Number of batch requests issued.
    pub batches: usize,
    /// Cached ids the backend no longer returns for the filter. They stay in
    /// the cache.
    pub missing_remotely: Vec<String>,
}

/// Refreshes cached collections from the backend.
pub struct DeltaSetReconciler {
    cache: Arc<Rack>,
    network: Arc<Rack>,
    batch_size: usize,
    timeout: Duration,
}

impl DeltaSetReconciler {
    pub fn new(cache: Arc<Rack>, network: Arc<Rack>) -> Self {
        Self {
            cache,
            network,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Ids per re-fetch request. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bring `collection` up to date for `query` and return the result.
    pub async fn pull(&self, collection: &str, query: &Query) -> CacheResult<PullResult> {
        self.pull_with_cancel(collection, query, &CancelHandle::new()).await
    }

    /// Like [`pull`](Self::pull), with the batch re-fetches cancellable through
    /// `cancel`.
    pub async fn pull_with_cancel(
        &self,
        collection: &str,
        query: &Query,
        cancel: &CancelHandle,
    ) -> CacheResult<PullResult> {
        validate_name("collection", collection)?;
        let filter = query.filter_only();

        let local = self.local_entities(collection, &filter).await?;

        let header_query = filter.clone().project(&[ID_FIELD, METADATA_FIELD]);
        let header_request = Request::get(collection)
            .with_query(header_query)
            .with_timeout(self.timeout);
        let header_response = self.network.execute(&header_request).await?;
        let mut headers = header_response.headers.clone();
        let remote = header_response.entities()?;

        let delta = compute_delta(local, &remote);
        debug!(
            collection,
            remote = remote.len(),
            unchanged = delta.unchanged.len(),
            refetch = delta.refetch_ids.len(),
            missing_remotely = delta.missing_remotely.len(),
            "computed delta set"
        );

        let batches: Vec<&[String]> = delta.refetch_ids.chunks(self.batch_size).collect();
        let batch_count = batches.len();
        let responses: Vec<Response> = try_join_all(
            batches
                .into_iter()
                .map(|ids| self.fetch_batch(collection, ids, cancel)),
        )
        .await?;

        let mut refetched = Vec::new();
        for response in responses {
            headers.merge(&response.headers);
            refetched.extend(response.entities()?);
        }

        if !refetched.is_empty() {
            let save = Request::put(collection).with_body(Body::Many(refetched.clone()));
            self.cache.execute(&save).await?;
        }
        info!(
            collection,
            refetched = refetched.len(),
            batches = batch_count,
            "pull complete"
        );

        let mut union = refetched;
        union.extend(delta.unchanged);
        Ok(PullResult {
            entities: query.apply_window(union),
            headers,
            refetched_ids: delta.refetch_ids,
            batches: batch_count,
            missing_remotely: delta.missing_remotely,
        })
    }

    async fn local_entities(&self, collection: &str, filter: &Query) -> CacheResult<Vec<Entity>> {
        let request = Request::get(collection).with_query(filter.clone());
        match self.cache.execute(&request).await {
            Ok(response) => response.entities(),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn fetch_batch(
        &self,
        collection: &str,
        ids: &[String],
        cancel: &CancelHandle,
    ) -> CacheResult<Response> {
        let request = Request::get(collection)
            .with_query(Query::new().filter(Filter::ids(ids.iter().cloned())))
            .with_timeout(self.timeout);
        self.network.execute_tracked(&request, cancel).await
    }
}
