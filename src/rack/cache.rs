/// Terminal stage of the cache rack.
///
/// Maps HTTP-shaped verbs onto adapter calls:
///
/// | Request | Adapter call |
/// |---|---|
/// | `GET` + id | `find_by_id` |
/// | `GET` + `_count` | `find`, count the entities matching the query |
/// | `GET` + `_group` | `find`, aggregate the entities matching the query |
/// | `GET` | `find`, then filter, sort, page and project in-process |
/// | `POST` / `PUT` | `save` |
/// | `DELETE` + id | `remove_by_id` |
/// | `DELETE` | remove every entity matching the query |
use super::{Exchange, Stage};
use crate::entity::{Entity, entities_to_json};
use crate::error::{CacheError, CacheResult};
use crate::persistence::Adapter;
use crate::query::{Aggregation, Query, QueryExecutor};
use crate::request::{Body, Method, Request, Response};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::debug;

/// Reserved id routing a GET to a count.
pub const COUNT_ID: &str = "_count";

/// Reserved id routing a GET to an aggregation.
pub const GROUP_ID: &str = "_group";

pub struct CacheStage {
    adapter: Arc<dyn Adapter>,
}

impl CacheStage {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    async fn dispatch(&self, request: &Request) -> CacheResult<Response> {
        let collection = request.collection();
        let query = request.query().cloned().unwrap_or_default();

        match (request.method(), request.id()) {
            (Method::Get, Some(COUNT_ID)) => {
                let entities = self.adapter.find(collection).await?;
                let count = entities
                    .iter()
                    .filter(|entity| query.matches_entity(entity))
                    .count();
                Ok(Response::ok(json!({ "count": count })))
            }
            (Method::Get, Some(GROUP_ID)) => {
                let aggregation = group_aggregation(request, &query)?;
                let entities = self.adapter.find(collection).await?;
                let result = QueryExecutor::execute(&query.aggregate(aggregation), entities)?;
                Ok(Response::ok(result.aggregation.unwrap_or(JsonValue::Null)))
            }
            (Method::Get, Some(id)) => {
                let entity = self.adapter.find_by_id(collection, id).await?;
                Ok(Response::ok(query.apply_projection(&entity.into_json())))
            }
            (Method::Get, None) => {
                let entities = self.adapter.find(collection).await?;
                let result = QueryExecutor::execute(&query, entities)?;
                Ok(Response::ok(entities_to_json(&result.entities)))
            }
            (Method::Post | Method::Put, _) => {
                let body = request.body().ok_or_else(|| {
                    CacheError::InvalidArgument("save requires a body".to_string())
                })?;
                let saved = self.adapter.save(collection, body.entities()?).await?;
                Ok(Response::ok(shape_like(body, saved)))
            }
            (Method::Delete, Some(id)) => {
                let removed = self.adapter.remove_by_id(collection, id).await?;
                Ok(Response::ok(serde_json::to_value(removed)?))
            }
            (Method::Delete, None) => {
                let entities = self.adapter.find(collection).await?;
                let matched = QueryExecutor::execute(&query, entities)?;
                let ids: Vec<String> = matched
                    .entities
                    .iter()
                    .filter_map(|e| e.id().map(String::from))
                    .collect();
                let removed = self.adapter.remove_many(collection, &ids).await?;
                debug!(collection, count = removed.count, "removed by query");
                Ok(Response::ok(serde_json::to_value(removed)?))
            }
        }
    }
}

/// The aggregation for a `_group` request: the body wins over the query.
fn group_aggregation(request: &Request, query: &Query) -> CacheResult<Aggregation> {
    if let Some(Body::Json(value)) = request.body() {
        return Ok(serde_json::from_value(value.clone())?);
    }
    query.aggregation.clone().ok_or_else(|| {
        CacheError::InvalidArgument("group requires an aggregation".to_string())
    })
}

/// A single-entity body gets a single entity back.
fn shape_like(body: &Body, saved: Vec<Entity>) -> JsonValue {
    let single = match body {
        Body::One(_) => true,
        Body::Many(_) => false,
        Body::Json(value) => !value.is_array(),
    };
    if single {
        saved
            .into_iter()
            .next()
            .map(Entity::into_json)
            .unwrap_or(JsonValue::Null)
    } else {
        entities_to_json(&saved)
    }
}

#[async_trait]
impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn handle<'a>(&self, mut exchange: Exchange<'a>) -> CacheResult<Exchange<'a>> {
        let request = exchange.request;
        let response = tokio::select! {
            result = self.dispatch(request) => result?,
            _ = exchange.cancel.cancelled() => return Err(CacheError::Cancelled),
        };
        exchange.response = Some(response);
        Ok(exchange)
    }
}
