/// Stages of the network rack: Serialize, Http, Parse.
use super::{Exchange, Stage};
use crate::error::{CacheError, CacheResult};
use crate::request::{Request, Response};
use crate::transport::{Transport, TransportError, TransportRequest};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Where collection requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub app_key: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            app_key: app_key.into(),
        }
    }

    /// `{base}/appdata/{app_key}/{collection}[/{id}]`, or `{base}{path}` for
    /// requests with an explicit path, plus the query parameters.
    pub fn url_for(&self, request: &Request) -> CacheResult<String> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            CacheError::InvalidArgument(format!("invalid base url '{}': {}", self.base_url, e))
        })?;

        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                CacheError::InvalidArgument(format!(
                    "base url '{}' cannot carry a path",
                    self.base_url
                ))
            })?;
            segments.pop_if_empty();
            match request.path() {
                Some(path) => {
                    segments.extend(path.split('/').filter(|s| !s.is_empty()));
                }
                None => {
                    segments.extend(["appdata", self.app_key.as_str(), request.collection()]);
                    if let Some(id) = request.id() {
                        segments.push(id);
                    }
                }
            }
        }

        if let Some(query) = request.query() {
            let pairs = query.to_query_pairs()?;
            if !pairs.is_empty() {
                url.query_pairs_mut().extend_pairs(pairs);
            }
        }
        Ok(url.into())
    }
}

/// Builds the URL and encodes the body per content type.
pub struct SerializeStage {
    endpoint: Endpoint,
}

impl SerializeStage {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Stage for SerializeStage {
    fn name(&self) -> &'static str {
        "serialize"
    }

    async fn handle<'a>(&self, mut exchange: Exchange<'a>) -> CacheResult<Exchange<'a>> {
        exchange.url = Some(self.endpoint.url_for(exchange.request)?);

        if !exchange.headers.contains("accept") {
            exchange.headers.set("accept", JSON_CONTENT_TYPE);
        }

        if let Some(body) = exchange.request.body() {
            if !exchange.headers.contains("content-type") {
                exchange.headers.set("content-type", JSON_CONTENT_TYPE);
            }
            let value = body.to_json();
            let payload = match exchange.headers.content_type() {
                Some(FORM_CONTENT_TYPE) => encode_form(&value)?.into_bytes(),
                _ => serde_json::to_vec(&value)?,
            };
            exchange.payload = Some(payload);
        }
        Ok(exchange)
    }
}

fn encode_form(value: &JsonValue) -> CacheResult<String> {
    let object = value.as_object().ok_or_else(|| {
        CacheError::InvalidArgument("form bodies must be JSON objects".to_string())
    })?;
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in object {
        let text = match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            JsonValue::Null => String::new(),
            _ => {
                return Err(CacheError::InvalidArgument(format!(
                    "form field '{}' must be a scalar",
                    key
                )));
            }
        };
        form.append_pair(key, &text);
    }
    Ok(form.finish())
}

/// Sends the request through the transport under the request timeout.
pub struct HttpStage {
    transport: Arc<dyn Transport>,
}

impl HttpStage {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

fn map_transport_error(err: TransportError, millis: u64) -> CacheError {
    match err {
        TransportError::Timeout => CacheError::Timeout { millis },
        TransportError::Connect(msg) | TransportError::Other(msg) => {
            CacheError::NetworkUnreachable(msg)
        }
    }
}

#[async_trait]
impl Stage for HttpStage {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn handle<'a>(&self, mut exchange: Exchange<'a>) -> CacheResult<Exchange<'a>> {
        let url = exchange.url.take().ok_or_else(|| {
            CacheError::InvalidArgument("http stage needs a serialized url".to_string())
        })?;
        let timeout = exchange.request.timeout();
        let millis = timeout.as_millis() as u64;
        let outgoing = TransportRequest {
            method: exchange.request.method(),
            url: url.clone(),
            headers: exchange.headers.clone(),
            body: exchange.payload.take(),
            timeout,
        };

        debug!(method = %outgoing.method, url = %outgoing.url, "sending request");
        let raw = tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.execute(outgoing)) => match result {
                Ok(Ok(raw)) => raw,
                Ok(Err(err)) => return Err(map_transport_error(err, millis)),
                Err(_) => return Err(CacheError::Timeout { millis }),
            },
            _ = exchange.cancel.cancelled() => return Err(CacheError::Cancelled),
        };
        trace!(url = %url, status = raw.status, bytes = raw.body.len(), "received response");

        exchange.url = Some(url);
        exchange.raw = Some(raw);
        Ok(exchange)
    }
}

/// Decodes the body and translates non-success statuses into errors.
pub struct ParseStage;

fn decode_body(content_type: Option<&str>, body: &[u8]) -> CacheResult<JsonValue> {
    if body.is_empty() {
        return Ok(JsonValue::Null);
    }
    let is_json = content_type
        .map(|ct| ct == JSON_CONTENT_TYPE || ct.ends_with("+json"))
        .unwrap_or(false);
    if is_json {
        return Ok(serde_json::from_slice(body)?);
    }
    let text = String::from_utf8_lossy(body);
    Ok(serde_json::from_str(&text).unwrap_or_else(|_| JsonValue::String(text.into_owned())))
}

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> &'static str {
        "parse"
    }

    async fn handle<'a>(&self, mut exchange: Exchange<'a>) -> CacheResult<Exchange<'a>> {
        let raw = exchange.raw.take().ok_or_else(|| {
            CacheError::InvalidArgument("parse stage needs a transport response".to_string())
        })?;
        let data = decode_body(raw.headers.content_type(), &raw.body)?;
        let response = Response::new(raw.status, data)
            .with_headers(raw.headers)
            .into_result(exchange.request)?;
        exchange.response = Some(response);
        Ok(exchange)
    }
}
