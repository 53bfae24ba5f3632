/// Transport abstraction for the network rack.
///
/// The rack only needs one capability: send a fully serialized request and get
/// back status, headers and body bytes. Connection failures and timeouts must be
/// distinguishable so the Http stage can map them onto the error taxonomy.
use crate::request::{Headers, Method};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A serialized request ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Raw transport answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// A response with a JSON body and matching content type.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = Headers::new();
        headers.set("content-type", "application/json");
        Self {
            status,
            headers,
            body: value.to_string().into_bytes(),
        }
    }
}

/// Transport-level failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// DNS resolution or TCP connect failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// No answer within the request timeout.
    #[error("timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Other(String),
}

/// Sends serialized requests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest)
    -> Result<TransportResponse, TransportError>;
}

#[cfg(feature = "http")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "http")]
mod reqwest_transport {
    use super::*;

    /// [`Transport`] over a shared `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(request.timeout);
            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(map_error)?;
            let status = response.status().as_u16();
            let mut headers = Headers::new();
            for (name, value) in response.headers() {
                if let Ok(value) = value.to_str() {
                    headers.set(name.as_str(), value);
                }
            }
            let body = response.bytes().await.map_err(map_error)?.to_vec();

            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        }
    }
}

/// Scriptable transport for tests and offline tooling.
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};

    type Handler =
        dyn Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync;

    /// Answers every request with a handler and records what it was sent.
    #[derive(Clone)]
    pub struct MockTransport {
        handler: Arc<Handler>,
        delay: Option<Duration>,
        requests: Arc<Mutex<Vec<TransportRequest>>>,
    }

    impl MockTransport {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&TransportRequest) -> Result<TransportResponse, TransportError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                handler: Arc::new(handler),
                delay: None,
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Always answer with the same response.
        pub fn always(response: TransportResponse) -> Self {
            Self::new(move |_| Ok(response.clone()))
        }

        /// Always fail with the same error.
        pub fn failing(error: TransportError) -> Self {
            Self::new(move |_| Err(error.clone()))
        }

        /// Wait this long before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Every request received so far, in arrival order.
        pub fn requests(&self) -> Vec<TransportRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(&request)
        }
    }
}
