//! Client multiplexer against an in-process engine

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wsapi_core::prelude::*;

fn counter_definition() -> Definition {
    let counter = Arc::new(Mutex::new(0i64));
    let bumped = counter.clone();

    Definition::new()
        .get("counter", move |_args: Vec<Value>| {
            let counter = counter.clone();
            async move { Ok(GetReturn::new(json!(*counter.lock())).tag("counter")) }
        })
        .get("double", |args: Vec<Value>| async move {
            let n: i64 = arg(&args, 0)?;
            Ok(GetReturn::new(json!(n * 2)))
        })
        .set("bump", move |args: Vec<Value>| {
            let counter = bumped.clone();
            async move {
                let by: i64 = arg(&args, 0)?;
                let mut value = counter.lock();
                *value += by;
                Ok(SetReturn::new(json!(*value)).invalidate("counter"))
            }
        })
}

/// Poll `check` until it holds or five seconds pass
async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_get_and_set_round_trip() {
    let engine = CacheEngine::new(counter_definition());
    let client = Client::local(&engine);

    let mut query = client.get("counter", vec![]).unwrap();
    assert_eq!(query.changed().await, Some(json!(0)));
    assert_eq!(query.loaded().await.unwrap(), json!(0));

    assert_eq!(client.set("bump", vec![json!(5)]).await.unwrap(), json!(5));
    assert_eq!(query.changed().await, Some(json!(5)));
    assert_eq!(query.snapshot().updates, 2);
}

#[tokio::test]
async fn test_shared_handles_use_one_server_subscription() {
    let engine = CacheEngine::new(counter_definition());
    let client = Client::local(&engine);

    let first = client.get("double", vec![json!(21)]).unwrap();
    let second = client.get("double", vec![json!(21)]).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.instances(), 2);

    assert_eq!(second.loaded().await.unwrap(), json!(42));
    assert_eq!(engine.stats().subscriptions, 1);

    first.kill();
    assert_eq!(second.value(), Some(json!(42)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.stats().subscriptions, 1);

    drop(second);
    eventually(|| engine.stats().subscriptions == 0).await;
    assert_eq!(client.live_count(), 0);
}

#[tokio::test]
async fn test_callbacks_follow_invalidation() {
    let engine = CacheEngine::new(counter_definition());
    let client = Client::local(&engine);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let query = client.get("counter", vec![]).unwrap();
    query.loaded().await.unwrap();

    let sink = seen.clone();
    let callback = query
        .subscribe(move |value| sink.lock().push(value.clone()))
        .unwrap();
    assert_eq!(*seen.lock(), vec![json!(0)]);

    client.set("bump", vec![json!(1)]).await.unwrap();
    eventually(|| seen.lock().len() == 2).await;
    assert_eq!(*seen.lock(), vec![json!(0), json!(1)]);

    assert!(query.unsubscribe(callback));
    client.set("bump", vec![json!(1)]).await.unwrap();
    eventually(|| query.value() == Some(json!(2))).await;
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test]
async fn test_rejections_reach_the_caller() {
    let engine = CacheEngine::new(counter_definition());
    let client = Client::local(&engine);

    let query = client.get("nope", vec![]).unwrap();
    let err = query.loaded().await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { .. }));
    assert!(err.to_string().contains("nope"));

    let err = client.set("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { .. }));

    // Bad arguments fail the user function, not the connection.
    let err = client.set("bump", vec![json!("x")]).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { .. }));
    assert_eq!(client.set("bump", vec![json!(1)]).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_reset_releases_server_side() {
    let engine = CacheEngine::new(counter_definition());
    let client = Client::local(&engine);

    let a = client.get("double", vec![json!(1)]).unwrap();
    let b = client.get("double", vec![json!(2)]).unwrap();
    a.loaded().await.unwrap();
    b.loaded().await.unwrap();
    assert_eq!(engine.stats().subscriptions, 2);

    client.reset().unwrap();
    assert_eq!(client.live_count(), 0);
    eventually(|| engine.stats().subscriptions == 0).await;

    // Old guards keep their last value; dropping them sends nothing.
    assert_eq!(a.value(), Some(json!(2)));
    drop(a);
    drop(b);

    let again = client.get("double", vec![json!(1)]).unwrap();
    assert_eq!(again.loaded().await.unwrap(), json!(2));
    assert_eq!(engine.stats().subscriptions, 1);
}

#[tokio::test]
async fn test_dropping_the_client_releases_the_session() {
    let engine = CacheEngine::new(counter_definition());
    let client = Client::local(&engine);

    let query = client.get("counter", vec![]).unwrap();
    query.loaded().await.unwrap();
    let other = client.get("double", vec![json!(3)]).unwrap();
    other.loaded().await.unwrap();

    // Guards forgotten by a reset send nothing when dropped.
    client.reset().unwrap();
    let again = client.get("counter", vec![]).unwrap();
    again.loaded().await.unwrap();
    drop(query);
    drop(other);
    drop(client);
    drop(again);

    eventually(|| engine.stats().subscriptions == 0).await;
    assert_eq!(engine.stats().sweep_queue, 2);
}
