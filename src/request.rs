/// Requests and responses flowing through a rack.
///
/// A [`Request`] is built once and then handed to [`crate::rack::Rack::execute`]
/// by reference. It cannot be mutated after that point, and it tracks its own
/// in-flight state so a second `execute` on the same instance fails with
/// `AlreadyInFlight` instead of queuing.
use crate::config::DEFAULT_TIMEOUT;
use crate::entity::{Entity, entities_from_json, entities_to_json, validate_name};
use crate::error::{CacheError, CacheResult};
use crate::query::Query;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// HTTP-shaped request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Upper-case verb as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header map. Names are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build headers from a JSON object of scalar values.
    pub fn from_json(value: &JsonValue) -> CacheResult<Self> {
        let object = value.as_object().ok_or_else(|| {
            CacheError::InvalidArgument("headers must be a JSON object".to_string())
        })?;

        let mut headers = Headers::new();
        for (name, value) in object {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                _ => {
                    return Err(CacheError::InvalidArgument(format!(
                        "header '{}' must be a string, number or boolean",
                        name
                    )));
                }
            };
            headers.set(name, value);
        }
        Ok(headers)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Copy every header from `other`, overwriting duplicates.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The media type of `content-type`, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }
}

/// Request payload.
///
/// `One` and `Many` keep the caller's shape so a single save returns a single
/// entity and a batch save returns a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    One(Entity),
    Many(Vec<Entity>),
    Json(JsonValue),
}

impl Body {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Body::One(entity) => entity.to_json(),
            Body::Many(entities) => entities_to_json(entities),
            Body::Json(value) => value.clone(),
        }
    }

    /// The entities carried by this body.
    pub fn entities(&self) -> CacheResult<Vec<Entity>> {
        match self {
            Body::One(entity) => Ok(vec![entity.clone()]),
            Body::Many(entities) => Ok(entities.clone()),
            Body::Json(value) => entities_from_json(value.clone()),
        }
    }
}

/// A single logical operation against one collection.
#[derive(Debug)]
pub struct Request {
    method: Method,
    collection: String,
    id: Option<String>,
    query: Option<Query>,
    body: Option<Body>,
    headers: Headers,
    timeout: Duration,
    path: Option<String>,
    in_flight: AtomicBool,
}

impl Request {
    pub fn new(method: Method, collection: impl Into<String>) -> Self {
        Self {
            method,
            collection: collection.into(),
            id: None,
            query: None,
            body: None,
            headers: Headers::new(),
            timeout: DEFAULT_TIMEOUT,
            path: None,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn get(collection: impl Into<String>) -> Self {
        Self::new(Method::Get, collection)
    }

    pub fn post(collection: impl Into<String>) -> Self {
        Self::new(Method::Post, collection)
    }

    pub fn put(collection: impl Into<String>) -> Self {
        Self::new(Method::Put, collection)
    }

    pub fn delete(collection: impl Into<String>) -> Self {
        Self::new(Method::Delete, collection)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.merge(&headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send to an explicit backend path instead of the collection endpoint.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Validate the request and mark it in flight.
    ///
    /// The returned guard clears the flag when dropped, whether the execution
    /// finished, failed or was dropped mid-await.
    pub fn begin(&self) -> CacheResult<InFlightGuard<'_>> {
        if self.path.is_none() {
            validate_name("collection", &self.collection)?;
        }
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CacheError::AlreadyInFlight)?;
        Ok(InFlightGuard {
            flag: &self.in_flight,
        })
    }
}

/// Clears a request's in-flight flag on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Status codes outside 2xx that still count as success.
const REDIRECT_ALLOW_LIST: [u16; 3] = [301, 302, 304];

/// Result of executing a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_code: u16,
    pub headers: Headers,
    pub data: JsonValue,
}

impl Response {
    pub fn new(status_code: u16, data: JsonValue) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            data,
        }
    }

    pub fn ok(data: JsonValue) -> Self {
        Self::new(200, data)
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) || REDIRECT_ALLOW_LIST.contains(&self.status_code)
    }

    /// The typed error this response represents, if it is not a success.
    pub fn error(&self, collection: &str, id: Option<&str>) -> Option<CacheError> {
        if self.is_success() {
            return None;
        }
        if self.status_code == 404 {
            return Some(CacheError::NotFound {
                collection: collection.to_string(),
                id: id.map(String::from),
            });
        }

        let text = |field: &str| match self.data.get(field) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let mut name = text("error");
        if name.is_empty() {
            name = reason_phrase(self.status_code).to_string();
        }
        let mut description = text("description");
        if description.is_empty() {
            if let JsonValue::String(s) = &self.data {
                description = s.clone();
            }
        }

        Some(CacheError::ServerRejected {
            status: self.status_code,
            name,
            description,
            debug: text("debug"),
        })
    }

    /// `Ok(self)` on success, the translated error otherwise.
    pub fn into_result(self, request: &Request) -> CacheResult<Response> {
        match self.error(request.collection(), request.id()) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Response data as a list of entities.
    pub fn entities(&self) -> CacheResult<Vec<Entity>> {
        entities_from_json(self.data.clone())
    }

    /// Response data as a single entity.
    pub fn entity(&self) -> CacheResult<Entity> {
        Entity::from_json(self.data.clone())
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "BadRequest",
        401 => "InvalidCredentials",
        403 => "Forbidden",
        404 => "NotFound",
        409 => "Conflict",
        429 => "TooManyRequests",
        500 => "InternalServerError",
        502 => "BadGateway",
        503 => "ServiceUnavailable",
        504 => "GatewayTimeout",
        _ => "ServerError",
    }
}
