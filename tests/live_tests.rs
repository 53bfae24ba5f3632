/// Live update tests through the client facade.
///
/// Registration goes over a mock transport answering the realtime user
/// endpoints; pushes travel through the in-process broker.
use delta_cache::live::{ChannelPubSub, ConnectionStatus};
use delta_cache::transport::mock::MockTransport;
use delta_cache::{
    ActiveUser, CacheError, LiveState, Query, Receiver, SyncClient, SyncConfig, TransportResponse,
    json,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn realtime_backend(revoke_status: u16) -> MockTransport {
    MockTransport::new(move |request| {
        if request.url.ends_with("/register-realtime") {
            Ok(TransportResponse::json(
                200,
                &json!({
                    "publishKey": "pub-key",
                    "subscribeKey": "sub-key",
                    "userChannelGroup": "u1.group"
                }),
            ))
        } else if request.url.ends_with("/unregister-realtime") {
            Ok(TransportResponse::json(revoke_status, &json!({})))
        } else {
            Ok(TransportResponse::json(404, &json!({"error": "NotFound"})))
        }
    })
}

async fn live_client(revoke_status: u16, broker: &ChannelPubSub) -> SyncClient {
    let config = SyncConfig::new("kid_app")
        .with_base_url("http://localhost:7007")
        .with_device_id("device-1");
    SyncClient::with_transport(config, Arc::new(realtime_backend(revoke_status)))
        .await
        .unwrap()
        .with_live(Arc::new(broker.clone()))
        .unwrap()
}

#[tokio::test]
async fn test_register_and_unregister() {
    let broker = ChannelPubSub::new();
    let client = live_client(204, &broker).await;
    let live = client.live().unwrap();

    live.register(&ActiveUser::new("u1")).await.unwrap();
    assert_eq!(live.state(), LiveState::Registered);
    assert_eq!(broker.member_count("u1.group"), 1);

    live.unregister().await.unwrap();
    assert_eq!(live.state(), LiveState::Unregistered);
    assert_eq!(broker.member_count("u1.group"), 0);
}

#[tokio::test]
async fn test_failed_revoke_leaves_service_uninitialized() {
    let broker = ChannelPubSub::new();
    let client = live_client(500, &broker).await;
    let live = client.live().unwrap();
    live.register(&ActiveUser::new("u1")).await.unwrap();

    let err = live.unregister().await.unwrap_err();
    assert!(matches!(err, CacheError::ServerRejected { status: 500, .. }));
    assert!(!live.is_initialized());

    // a fresh registration is possible afterwards
    live.register(&ActiveUser::new("u1")).await.unwrap();
    assert!(live.is_initialized());
}

#[tokio::test]
async fn test_pushed_entity_reaches_cache_and_receiver() {
    let broker = ChannelPubSub::new();
    broker.add_channel_to_group("u1.group", "kid_app.c-books");
    let client = live_client(204, &broker).await;
    let live = client.live().unwrap();
    live.register(&ActiveUser::new("u1")).await.unwrap();

    let messages = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(AtomicUsize::new(0));
    let (m, s) = (messages.clone(), statuses.clone());
    live.subscribe(
        "books",
        Receiver::new()
            .on_message(move |payload| m.lock().unwrap().push(payload.clone()))
            .on_status(move |status| {
                if *status == ConnectionStatus::Reconnected {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            }),
    )
    .unwrap();

    broker.publish("kid_app.c-books", json!({"id": "b9", "title": "Solaris"}));
    broker.publish("kid_app.c-authors", json!({"id": "x"}));
    live.dispatch_pending().await;

    assert_eq!(
        messages.lock().unwrap().clone(),
        vec![json!({"id": "b9", "title": "Solaris"})]
    );
    let books = client.collection("books").unwrap();
    let cached = books.find_by_id("b9").await.unwrap();
    assert_eq!(cached.get("title"), Some(&json!("Solaris")));
    assert_eq!(books.count(&Query::new()).await.unwrap(), 1);

    live.on_connectivity_change(false).await.unwrap();
    live.on_connectivity_change(true).await.unwrap();
    assert!(live.dispatch_next().await);
    assert_eq!(statuses.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registration_rejected_by_backend() {
    let transport = MockTransport::always(TransportResponse::json(
        401,
        &json!({"error": "InvalidCredentials"}),
    ));
    let config = SyncConfig::new("kid_app").with_base_url("http://localhost:7007");
    let client = SyncClient::with_transport(config, Arc::new(transport))
        .await
        .unwrap()
        .with_live(Arc::new(ChannelPubSub::new()))
        .unwrap();
    let live = client.live().unwrap();

    assert!(live.register(&ActiveUser::new("u1")).await.is_err());
    assert_eq!(live.state(), LiveState::Unregistered);
    assert!(matches!(
        live.subscribe("books", Receiver::new().on_message(|_| {})),
        Err(CacheError::NotRegistered)
    ));
}
