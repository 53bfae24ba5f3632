/// Request pipeline tests.
///
/// These drive the cache rack and the network rack end to end, including the
/// in-flight guard and cancellation.
use delta_cache::persistence::MemoryAdapter;
use delta_cache::query::Filter;
use delta_cache::rack::cache::{COUNT_ID, GROUP_ID};
use delta_cache::transport::mock::MockTransport;
use delta_cache::{
    Adapter, Aggregation, Body, CacheError, Endpoint, Entity, Query, Rack, Request,
    TransportResponse, json,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn cache_rack() -> (Arc<MemoryAdapter>, Rack) {
    let adapter = Arc::new(MemoryAdapter::new("kid_app").unwrap());
    let rack = Rack::cache(adapter.clone());
    (adapter, rack)
}

fn books() -> Vec<Entity> {
    vec![
        Entity::from_json(json!({"id": "a", "author": "Herbert", "pages": 412})).unwrap(),
        Entity::from_json(json!({"id": "b", "author": "Le Guin", "pages": 248})).unwrap(),
        Entity::from_json(json!({"id": "c", "author": "Herbert", "pages": 336})).unwrap(),
    ]
}

#[tokio::test]
async fn test_cache_miss_is_empty() {
    let (_, rack) = cache_rack();
    let response = rack.execute(&Request::get("books")).await.unwrap();
    assert_eq!(response.data, json!([]));
}

#[tokio::test]
async fn test_find_by_id_miss_is_not_found() {
    let (_, rack) = cache_rack();
    let err = rack
        .execute(&Request::get("books").with_id("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound { .. }));
}

#[tokio::test]
async fn test_remove_absent_id_keeps_collection() {
    let (adapter, rack) = cache_rack();
    adapter.save("books", books()).await.unwrap();

    let err = rack
        .execute(&Request::delete("books").with_id("zzz"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(adapter.find("books").await.unwrap(), books());
}

#[tokio::test]
async fn test_query_count_and_group() {
    let (adapter, rack) = cache_rack();
    adapter.save("books", books()).await.unwrap();

    let herbert = Query::new().filter(Filter::eq("author", "Herbert"));
    let response = rack
        .execute(&Request::get("books").with_query(herbert.clone().sort_by("pages", true)))
        .await
        .unwrap();
    let ids: Vec<&str> = response
        .data
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["c", "a"]);

    let count = rack
        .execute(
            &Request::get("books")
                .with_id(COUNT_ID)
                .with_query(herbert.clone()),
        )
        .await
        .unwrap();
    assert_eq!(count.data, json!({"count": 2}));

    let group = rack
        .execute(
            &Request::get("books")
                .with_id(GROUP_ID)
                .with_body(Body::Json(serde_json::to_value(Aggregation::max("pages")).unwrap())),
        )
        .await
        .unwrap();
    assert_eq!(group.data, json!(412));
}

#[tokio::test]
async fn test_delete_by_query() {
    let (adapter, rack) = cache_rack();
    adapter.save("books", books()).await.unwrap();

    let response = rack
        .execute(
            &Request::delete("books").with_query(Query::new().filter(Filter::gt("pages", 300))),
        )
        .await
        .unwrap();
    assert_eq!(response.data["count"], json!(2));
    let left = adapter.find("books").await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id(), Some("b"));
}

#[tokio::test]
async fn test_save_keeps_body_shape() {
    let (_, rack) = cache_rack();
    let one = rack
        .execute(&Request::put("books").with_body(Body::One(Entity::with_id("x"))))
        .await
        .unwrap();
    assert!(one.data.is_object());

    let many = rack
        .execute(&Request::post("books").with_body(Body::Many(vec![Entity::with_id("y")])))
        .await
        .unwrap();
    assert!(many.data.is_array());
}

fn slow_network(delay: Duration) -> Rack {
    let transport = MockTransport::always(TransportResponse::json(200, &json!([])))
        .with_delay(delay);
    Rack::network(
        Arc::new(transport),
        Endpoint::new("http://localhost:7007", "kid_app"),
    )
}

#[tokio::test]
async fn test_reentrant_execute_fails_immediately() {
    let rack = slow_network(Duration::from_millis(300));
    let request = Request::get("books");

    let (first, second) = tokio::join!(rack.execute(&request), async {
        sleep(Duration::from_millis(30)).await;
        rack.execute(&request).await
    });
    assert!(first.is_ok());
    assert!(matches!(second, Err(CacheError::AlreadyInFlight)));
    assert!(!request.is_in_flight());
}

#[tokio::test]
async fn test_cancel_aborts_http_stage() {
    let rack = slow_network(Duration::from_secs(5));
    let request = Request::get("books");

    let (result, _) = tokio::join!(rack.execute(&request), async {
        sleep(Duration::from_millis(50)).await;
        assert_eq!(rack.last_reached(), Some("http"));
        rack.cancel();
    });
    assert!(matches!(result, Err(CacheError::Cancelled)));
    assert!(!request.is_in_flight());
}

#[tokio::test]
async fn test_rack_is_usable_after_cancel() {
    let rack = slow_network(Duration::from_millis(1));
    rack.cancel();
    assert!(rack.execute(&Request::get("books")).await.is_ok());
}

#[tokio::test]
async fn test_cancel_leaves_older_request_running() {
    let rack = slow_network(Duration::from_millis(300));
    let (older, newer) = (Request::get("books"), Request::get("authors"));

    let (older, newer, cancelled) = tokio::join!(
        rack.execute(&older),
        async {
            sleep(Duration::from_millis(30)).await;
            rack.execute(&newer).await
        },
        async {
            sleep(Duration::from_millis(100)).await;
            rack.cancel()
        }
    );
    assert!(cancelled);
    assert!(older.is_ok());
    assert!(matches!(newer, Err(CacheError::Cancelled)));
}

#[tokio::test]
async fn test_cancel_after_completion_is_a_no_op() {
    let rack = slow_network(Duration::from_millis(1));
    rack.execute(&Request::get("books")).await.unwrap();
    assert!(!rack.cancel());
}
