/// Realtime registration over the backend's user endpoints.
use super::{ActiveUser, PubSubConfig, RealtimeBackend};
use crate::error::{CacheError, CacheResult};
use crate::rack::Rack;
use crate::request::{Body, Request};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// `POST /user/{app}/{user}/register-realtime` and `unregister-realtime`.
pub struct HttpRealtimeBackend {
    network: Arc<Rack>,
    app_key: String,
    timeout: Option<Duration>,
}

impl HttpRealtimeBackend {
    pub fn new(network: Arc<Rack>, app_key: impl Into<String>) -> Self {
        Self {
            network,
            app_key: app_key.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn request(&self, user: &ActiveUser, device_id: &str, action: &str) -> CacheResult<Request> {
        let user_id = user.id.as_deref().ok_or_else(|| {
            CacheError::InvalidArgument("realtime calls require a user id".to_string())
        })?;
        let mut request = Request::post("")
            .with_path(format!("/user/{}/{}/{}", self.app_key, user_id, action))
            .with_body(Body::Json(json!({ "deviceId": device_id })));
        if let Some(token) = &user.auth_token {
            request = request.with_header("authorization", format!("Bearer {}", token));
        }
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }
        Ok(request)
    }
}

#[async_trait]
impl RealtimeBackend for HttpRealtimeBackend {
    async fn register(&self, user: &ActiveUser, device_id: &str) -> CacheResult<PubSubConfig> {
        let request = self.request(user, device_id, "register-realtime")?;
        let response = self.network.execute(&request).await?;
        Ok(serde_json::from_value(response.data)?)
    }

    async fn unregister(&self, user: &ActiveUser, device_id: &str) -> CacheResult<()> {
        let request = self.request(user, device_id, "unregister-realtime")?;
        self.network.execute(&request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rack::Endpoint;
    use crate::transport::TransportResponse;
    use crate::transport::mock::MockTransport;
    use serde_json::Value as JsonValue;

    #[tokio::test]
    async fn test_register_posts_device_id() {
        let transport = MockTransport::always(TransportResponse::json(
            200,
            &json!({"publishKey": "p", "subscribeKey": "s", "userChannelGroup": "u1.group"}),
        ));
        let rack = Arc::new(Rack::network(
            Arc::new(transport.clone()),
            Endpoint::new("http://localhost:7007", "kid_app"),
        ));
        let backend = HttpRealtimeBackend::new(rack, "kid_app");

        let user = ActiveUser::new("u1").with_auth_token("tok");
        let config = backend.register(&user, "device-1").await.unwrap();
        assert_eq!(config.user_channel_group, "u1.group");

        let sent = &transport.requests()[0];
        assert_eq!(
            sent.url,
            "http://localhost:7007/user/kid_app/u1/register-realtime"
        );
        assert_eq!(sent.headers.get("authorization"), Some("Bearer tok"));
        let body: JsonValue = serde_json::from_slice(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"deviceId": "device-1"}));
    }

    #[tokio::test]
    async fn test_unregister_surfaces_rejection() {
        let transport = MockTransport::always(TransportResponse::json(
            500,
            &json!({"error": "InternalError"}),
        ));
        let rack = Arc::new(Rack::network(
            Arc::new(transport),
            Endpoint::new("http://localhost:7007", "kid_app"),
        ));
        let backend = HttpRealtimeBackend::new(rack, "kid_app");

        let err = backend
            .unregister(&ActiveUser::new("u1"), "device-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ServerRejected { status: 500, .. }));
    }
}
