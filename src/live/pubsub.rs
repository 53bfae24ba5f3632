/// In-process pub/sub broker.
///
/// Channels are grouped the way the realtime service groups them: the server
/// side adds collection channels to a user's channel group with
/// [`ChannelPubSub::add_channel_to_group`], clients subscribe to the group and
/// receive everything published on its channels. Delivery is immediate, into
/// each client's listener queue.
use super::{ConnectionStatus, EventSender, LiveEvent, PubSubClient, PubSubConfig, PubSubConnector};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[derive(Default)]
struct Member {
    groups: HashSet<String>,
    listener: Option<EventSender>,
}

impl Member {
    fn send(&self, event: LiveEvent) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| listener.send(event).is_ok())
    }
}

#[derive(Default)]
struct Broker {
    group_channels: DashMap<String, HashSet<String>>,
    members: DashMap<u64, Member>,
    next_id: AtomicU64,
    reconnects: AtomicU64,
    events_delivered: AtomicU64,
}

/// Loopback implementation of [`PubSubConnector`].
#[derive(Clone, Default)]
pub struct ChannelPubSub {
    inner: Arc<Broker>,
}

impl ChannelPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel_to_group(&self, group: &str, channel: &str) {
        self.inner
            .group_channels
            .entry(group.to_string())
            .or_default()
            .insert(channel.to_string());
    }

    pub fn remove_channel_from_group(&self, group: &str, channel: &str) {
        if let Some(mut channels) = self.inner.group_channels.get_mut(group) {
            channels.remove(channel);
        }
    }

    fn groups_for(&self, channel: &str) -> HashSet<String> {
        self.inner
            .group_channels
            .iter()
            .filter(|entry| entry.value().contains(channel))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Publish `payload` on `channel`. Returns the number of clients reached.
    pub fn publish(&self, channel: &str, payload: JsonValue) -> usize {
        let groups = self.groups_for(channel);
        let event = LiveEvent::Message {
            channel: channel.to_string(),
            payload,
        };
        let delivered = self.fan_out(|member| !member.groups.is_disjoint(&groups), &event);
        trace!(channel, delivered, "published");
        delivered
    }

    /// Report an error on `channel` to every client that can see it.
    pub fn publish_error(&self, channel: &str, message: &str) -> usize {
        let groups = self.groups_for(channel);
        let event = LiveEvent::Error {
            channel: Some(channel.to_string()),
            message: message.to_string(),
        };
        self.fan_out(|member| !member.groups.is_disjoint(&groups), &event)
    }

    /// Push a connection status to every connected client.
    pub fn broadcast_status(&self, status: ConnectionStatus) -> usize {
        self.fan_out(|_| true, &LiveEvent::Status(status))
    }

    fn fan_out(&self, wants: impl Fn(&Member) -> bool, event: &LiveEvent) -> usize {
        let mut delivered = 0;
        for member in self.inner.members.iter() {
            if wants(member.value()) && member.value().send(event.clone()) {
                delivered += 1;
            }
        }
        self.inner
            .events_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Clients currently subscribed to `group`.
    pub fn member_count(&self, group: &str) -> usize {
        self.inner
            .members
            .iter()
            .filter(|member| member.value().groups.contains(group))
            .count()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    pub fn events_delivered(&self) -> u64 {
        self.inner.events_delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PubSubConnector for ChannelPubSub {
    async fn connect(&self, config: &PubSubConfig) -> CacheResult<Box<dyn PubSubClient>> {
        if config.subscribe_key.is_empty() {
            return Err(CacheError::InvalidArgument(
                "pub/sub connection requires a subscribe key".to_string(),
            ));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.members.insert(id, Member::default());
        Ok(Box::new(ChannelClient {
            id,
            broker: self.inner.clone(),
        }))
    }
}

struct ChannelClient {
    id: u64,
    broker: Arc<Broker>,
}

impl ChannelClient {
    fn with_member<T>(&self, f: impl FnOnce(&mut Member) -> T) -> CacheResult<T> {
        let mut member = self.broker.members.get_mut(&self.id).ok_or_else(|| {
            CacheError::StoreUnavailable(format!("pub/sub client {} is gone", self.id))
        })?;
        Ok(f(member.value_mut()))
    }
}

#[async_trait]
impl PubSubClient for ChannelClient {
    fn add_listener(&self, listener: EventSender) {
        if let Some(mut member) = self.broker.members.get_mut(&self.id) {
            member.listener = Some(listener);
        }
    }

    fn remove_listener(&self) {
        if let Some(mut member) = self.broker.members.get_mut(&self.id) {
            member.listener = None;
        }
    }

    async fn subscribe_group(&self, group: &str) -> CacheResult<()> {
        self.with_member(|member| {
            member.groups.insert(group.to_string());
            member.send(LiveEvent::Status(ConnectionStatus::Connected));
        })
    }

    async fn unsubscribe_all(&self) -> CacheResult<()> {
        self.with_member(|member| member.groups.clear())
    }

    async fn reconnect(&self) -> CacheResult<()> {
        self.broker.reconnects.fetch_add(1, Ordering::Relaxed);
        self.with_member(|member| {
            member.send(LiveEvent::Status(ConnectionStatus::Reconnected));
        })
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.broker.members.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn config() -> PubSubConfig {
        PubSubConfig {
            publish_key: "pub".into(),
            subscribe_key: "sub".into(),
            user_channel_group: "g".into(),
        }
    }

    #[tokio::test]
    async fn test_group_routing() {
        let broker = ChannelPubSub::new();
        broker.add_channel_to_group("g", "app.c-books");

        let client = broker.connect(&config()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.add_listener(tx);
        client.subscribe_group("g").await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LiveEvent::Status(ConnectionStatus::Connected))
        );

        assert_eq!(broker.publish("app.c-books", json!({"id": "1"})), 1);
        assert_eq!(broker.publish("app.c-authors", json!({"id": "2"})), 0);
        assert!(matches!(
            rx.recv().await,
            Some(LiveEvent::Message { channel, .. }) if channel == "app.c-books"
        ));

        client.unsubscribe_all().await.unwrap();
        assert_eq!(broker.publish("app.c-books", json!({})), 0);
    }

    #[tokio::test]
    async fn test_dropped_client_leaves_broker() {
        let broker = ChannelPubSub::new();
        let client = broker.connect(&config()).await.unwrap();
        client.subscribe_group("g").await.unwrap();
        assert_eq!(broker.member_count("g"), 1);
        drop(client);
        assert_eq!(broker.member_count("g"), 0);
    }

    #[tokio::test]
    async fn test_connect_requires_subscribe_key() {
        let mut config = config();
        config.subscribe_key.clear();
        assert!(ChannelPubSub::new().connect(&config).await.is_err());
    }
}
