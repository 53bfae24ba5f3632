/// Live updates pushed by the backend.
///
/// A [`LiveService`] registers the device for realtime delivery, connects one
/// pub/sub client for the user's channel group and routes every inbound event
/// to the [`Receiver`] subscribed for the event's collection.
///
/// ## Lifecycle
///
/// ```text
/// Unregistered --register--> Registering --ok--> Registered
///      ^                          |                   |
///      +--------- failure --------+              unregister
///      |                                              v
///      +-------------------------------------- Unregistering
/// ```
///
/// Inbound events are queued on a single channel and delivered by
/// [`LiveService::dispatch_pending`] or [`LiveService::dispatch_next`], so
/// receivers never run concurrently with each other.
pub mod backend;
pub mod pubsub;

pub use backend::HttpRealtimeBackend;
pub use pubsub::ChannelPubSub;

use crate::entity::{Entity, validate_name};
use crate::error::{CacheError, CacheResult};
use crate::rack::Rack;
use crate::request::{Body, Request};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Registration state of a [`LiveService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LiveState {
    Unregistered = 0,
    Registering = 1,
    Registered = 2,
    Unregistering = 3,
}

impl LiveState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LiveState::Registering,
            2 => LiveState::Registered,
            3 => LiveState::Unregistering,
            _ => LiveState::Unregistered,
        }
    }
}

impl fmt::Display for LiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LiveState::Unregistered => "unregistered",
            LiveState::Registering => "registering",
            LiveState::Registered => "registered",
            LiveState::Unregistering => "unregistering",
        };
        f.write_str(name)
    }
}

/// The user a device registers for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveUser {
    pub id: Option<String>,
    /// Session token sent with registration calls.
    pub auth_token: Option<String>,
}

impl ActiveUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Keys and group returned by a successful realtime registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubConfig {
    pub publish_key: String,
    pub subscribe_key: String,
    pub user_channel_group: String,
}

/// Connection status reported by the pub/sub client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnected,
}

/// An event delivered by the pub/sub client.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Message { channel: String, payload: JsonValue },
    Error { channel: Option<String>, message: String },
    Status(ConnectionStatus),
}

/// Where a pub/sub client delivers its events.
pub type EventSender = mpsc::UnboundedSender<LiveEvent>;

/// Server calls that enable and revoke realtime delivery for a device.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    async fn register(&self, user: &ActiveUser, device_id: &str) -> CacheResult<PubSubConfig>;

    async fn unregister(&self, user: &ActiveUser, device_id: &str) -> CacheResult<()>;
}

/// Builds pub/sub clients from registration keys.
#[async_trait]
pub trait PubSubConnector: Send + Sync {
    async fn connect(&self, config: &PubSubConfig) -> CacheResult<Box<dyn PubSubClient>>;
}

/// One connection to the pub/sub network.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    fn add_listener(&self, listener: EventSender);

    fn remove_listener(&self);

    async fn subscribe_group(&self, group: &str) -> CacheResult<()>;

    async fn unsubscribe_all(&self) -> CacheResult<()>;

    async fn reconnect(&self) -> CacheResult<()>;
}

type MessageFn = Box<dyn Fn(&JsonValue) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&CacheError) + Send + Sync>;
type StatusFn = Box<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Callbacks for one collection's live events.
#[derive(Default)]
pub struct Receiver {
    on_message: Option<MessageFn>,
    on_error: Option<ErrorFn>,
    on_status: Option<StatusFn>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, f: impl Fn(&JsonValue) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(&ConnectionStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_message.is_none() && self.on_error.is_none() && self.on_status.is_none()
    }

    fn message(&self, payload: &JsonValue) {
        if let Some(f) = &self.on_message {
            f(payload);
        }
    }

    fn error(&self, err: &CacheError) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }

    fn status(&self, status: &ConnectionStatus) {
        if let Some(f) = &self.on_status {
            f(status);
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_status", &self.on_status.is_some())
            .finish()
    }
}

/// A collection subscription as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub collection: String,
    pub channel: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

struct SubscriptionState {
    collection: String,
    receiver: Receiver,
    created_at: DateTime<Utc>,
}

struct Session {
    user: ActiveUser,
    client: Box<dyn PubSubClient>,
}

/// Realtime registration plus per-collection routing of pushed events.
pub struct LiveService {
    app_key: String,
    device_id: String,
    backend: Arc<dyn RealtimeBackend>,
    connector: Arc<dyn PubSubConnector>,
    cache: Option<Arc<Rack>>,
    state: AtomicU8,
    connected: AtomicBool,
    session: Mutex<Option<Session>>,
    subscriptions: DashMap<String, SubscriptionState>,
    events_tx: EventSender,
    events_rx: Mutex<mpsc::UnboundedReceiver<LiveEvent>>,
}

impl LiveService {
    pub fn new(
        app_key: impl Into<String>,
        device_id: impl Into<String>,
        backend: Arc<dyn RealtimeBackend>,
        connector: Arc<dyn PubSubConnector>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            app_key: app_key.into(),
            device_id: device_id.into(),
            backend,
            connector,
            cache: None,
            state: AtomicU8::new(LiveState::Unregistered as u8),
            connected: AtomicBool::new(true),
            session: Mutex::new(None),
            subscriptions: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(events_rx),
        }
    }

    /// Write pushed entities to the cache through `cache` before delivery.
    pub fn with_cache(mut self, cache: Arc<Rack>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> LiveState {
        LiveState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == LiveState::Registered
    }

    /// Channel carrying pushes for `collection`.
    pub fn channel_name(&self, collection: &str) -> String {
        format!("{}.c-{}", self.app_key, collection)
    }

    fn transition(&self, from: LiveState, to: LiveState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: LiveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Register `user` for realtime delivery on this device.
    pub async fn register(&self, user: &ActiveUser) -> CacheResult<()> {
        if user.id.as_deref().is_none_or(str::is_empty) {
            return Err(CacheError::InvalidArgument(
                "live registration requires a user id".to_string(),
            ));
        }
        if !self.transition(LiveState::Unregistered, LiveState::Registering) {
            return Err(CacheError::AlreadyRegistered);
        }

        match self.connect(user).await {
            Ok(session) => {
                *self.session.lock().await = Some(session);
                self.set_state(LiveState::Registered);
                info!(user = ?user.id, device = %self.device_id, "live service registered");
                Ok(())
            }
            Err(err) => {
                self.set_state(LiveState::Unregistered);
                warn!(user = ?user.id, error = %err, "live registration failed");
                Err(err)
            }
        }
    }

    async fn connect(&self, user: &ActiveUser) -> CacheResult<Session> {
        let config = self.backend.register(user, &self.device_id).await?;
        match self.open_session(user, &config).await {
            Ok(session) => Ok(session),
            Err(err) => {
                if let Err(revoke) = self.backend.unregister(user, &self.device_id).await {
                    warn!(user = ?user.id, error = %revoke, "could not revoke abandoned registration");
                }
                Err(err)
            }
        }
    }

    async fn open_session(&self, user: &ActiveUser, config: &PubSubConfig) -> CacheResult<Session> {
        let client = self.connector.connect(config).await?;
        client.add_listener(self.events_tx.clone());
        if let Err(err) = client.subscribe_group(&config.user_channel_group).await {
            client.remove_listener();
            return Err(err);
        }
        debug!(group = %config.user_channel_group, "subscribed to user channel group");
        Ok(Session {
            user: user.clone(),
            client,
        })
    }

    /// Revoke realtime delivery and tear the connection down.
    ///
    /// Always ends `Unregistered`. A failed revoke is reported after the
    /// local teardown has completed.
    pub async fn unregister(&self) -> CacheResult<()> {
        if !self.transition(LiveState::Registered, LiveState::Unregistering) {
            return Err(CacheError::NotRegistered);
        }

        let session = self.session.lock().await.take();
        let mut result = Ok(());
        if let Some(session) = session {
            result = self
                .backend
                .unregister(&session.user, &self.device_id)
                .await;
            let teardown = session.client.unsubscribe_all().await;
            session.client.remove_listener();
            if result.is_ok() {
                result = teardown;
            }
        }
        self.subscriptions.clear();
        self.set_state(LiveState::Unregistered);

        match &result {
            Ok(()) => info!(device = %self.device_id, "live service unregistered"),
            Err(err) => warn!(error = %err, "live unregistration reported an error"),
        }
        result
    }

    /// Route live events for `collection` to `receiver`, replacing any
    /// receiver already attached to it.
    pub fn subscribe(&self, collection: &str, receiver: Receiver) -> CacheResult<()> {
        validate_name("collection", collection)?;
        if receiver.is_empty() {
            return Err(CacheError::InvalidArgument(
                "receiver needs at least one callback".to_string(),
            ));
        }
        if !self.is_initialized() {
            return Err(CacheError::NotRegistered);
        }

        let channel = self.channel_name(collection);
        debug!(collection, channel = %channel, "attaching receiver");
        self.subscriptions.insert(
            channel,
            SubscriptionState {
                collection: collection.to_string(),
                receiver,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Detach the receiver for `collection`. Returns whether one was attached.
    pub fn unsubscribe(&self, collection: &str) -> bool {
        self.subscriptions
            .remove(&self.channel_name(collection))
            .is_some()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let active = self.is_initialized();
        let mut list: Vec<SubscriptionInfo> = self
            .subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                collection: entry.value().collection.clone(),
                channel: entry.key().clone(),
                is_active: active,
                created_at: entry.value().created_at,
            })
            .collect();
        list.sort_by(|a, b| a.collection.cmp(&b.collection));
        list
    }

    /// Report a connectivity change. Returns whether a reconnect was issued.
    pub async fn on_connectivity_change(&self, connected: bool) -> CacheResult<bool> {
        let was_connected = self.connected.swap(connected, Ordering::AcqRel);
        if !connected || was_connected || !self.is_initialized() {
            return Ok(false);
        }
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(session) => {
                debug!("connectivity restored, reconnecting");
                session.client.reconnect().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deliver every queued event. Returns how many were handled.
    pub async fn dispatch_pending(&self) -> usize {
        let mut events = Vec::new();
        {
            let mut rx = self.events_rx.lock().await;
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        let count = events.len();
        for event in events {
            self.dispatch(event).await;
        }
        count
    }

    /// Wait for the next event and deliver it.
    pub async fn dispatch_next(&self) -> bool {
        let event = self.events_rx.lock().await.recv().await;
        match event {
            Some(event) => {
                self.dispatch(event).await;
                true
            }
            None => false,
        }
    }

    async fn dispatch(&self, event: LiveEvent) {
        match event {
            LiveEvent::Message { channel, payload } => {
                let collection = channel
                    .strip_prefix(&format!("{}.c-", self.app_key))
                    .map(str::to_string);
                let written = match (&collection, &self.cache) {
                    (Some(collection), Some(cache)) => {
                        self.write_through(cache, collection, &payload).await
                    }
                    _ => Ok(()),
                };
                let Some(state) = self.subscriptions.get(&channel) else {
                    debug!(channel = %channel, "no receiver for channel");
                    return;
                };
                match written {
                    Ok(()) => state.receiver.message(&payload),
                    Err(err) => state.receiver.error(&err),
                }
            }
            LiveEvent::Error { channel, message } => {
                let err = CacheError::NetworkUnreachable(message);
                match channel {
                    Some(channel) => {
                        if let Some(state) = self.subscriptions.get(&channel) {
                            state.receiver.error(&err);
                        }
                    }
                    None => {
                        for entry in self.subscriptions.iter() {
                            entry.value().receiver.error(&err);
                        }
                    }
                }
            }
            LiveEvent::Status(status) => {
                self.connected.store(
                    status != ConnectionStatus::Disconnected,
                    Ordering::Release,
                );
                for entry in self.subscriptions.iter() {
                    entry.value().receiver.status(&status);
                }
            }
        }
    }

    async fn write_through(
        &self,
        cache: &Rack,
        collection: &str,
        payload: &JsonValue,
    ) -> CacheResult<()> {
        let Ok(entity) = Entity::from_json(payload.clone()) else {
            return Ok(());
        };
        if entity.id().is_none() {
            return Ok(());
        }
        let request = Request::put(collection).with_body(Body::One(entity));
        cache.execute(&request).await?;
        debug!(collection, "cached pushed entity");
        Ok(())
    }
}

impl fmt::Debug for LiveService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveService")
            .field("app_key", &self.app_key)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
