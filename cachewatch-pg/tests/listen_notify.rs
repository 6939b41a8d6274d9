//! LISTEN/NOTIFY round trips against a live server.
//!
//! Run with `--features db-tests` and `CACHEWATCH_DSN` (or the
//! `CACHEWATCH_DB_*` variables) pointing at a scratch database.

#![cfg(feature = "db-tests")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachewatch_events::{Channel, EventQueue, Greedy, Operation};
use cachewatch_pg::{connect, emit_event, DbConfig, PgNotificationSource};
use cachewatch_storage::MemoizingCache;
use cachewatch_test_utils::{fixtures::EventBuilder, init_tracing};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_emitted_event_reaches_queue() {
    init_tracing();
    let config = DbConfig::from_env();
    let channel = Channel::new("ch_cachewatch_test_emit");

    let queue = EventQueue::new();
    queue
        .connect(&PgNotificationSource::from_config(&config), channel.clone())
        .await
        .unwrap();
    assert!(queue.connection_healthy());

    let client = connect(&config).await.unwrap();
    let event = EventBuilder::new()
        .channel(channel.clone())
        .table("orders")
        .operation(Operation::Truncate)
        .build();
    emit_event(&client, &event).await.unwrap();

    wait_until(|| queue.size() == 1).await;
    let received = queue.dequeue_nowait().unwrap();
    assert_eq!(received.channel(), &channel);
    assert_eq!(received.table(), "orders");
    assert_eq!(received.operation(), Operation::Truncate);
    assert_eq!(received.sent_at(), event.sent_at());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_trigger_payload_is_parsed() {
    init_tracing();
    let config = DbConfig::from_env();
    let channel = Channel::new("ch_cachewatch_test_trigger");

    let queue = EventQueue::new();
    queue
        .connect(&PgNotificationSource::from_config(&config), channel.clone())
        .await
        .unwrap();

    // Same shape a notify trigger produces, with the server's own timestamp.
    let client = connect(&config).await.unwrap();
    client
        .batch_execute(
            "SELECT pg_notify('ch_cachewatch_test_trigger', json_build_object(\
               'operation', 'update', 'table', 'users', 'sent_at', NOW())::text)",
        )
        .await
        .unwrap();

    wait_until(|| queue.size() == 1).await;
    assert_eq!(queue.dequeue_nowait().unwrap().operation(), Operation::Update);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notification_invalidates_memoized_call() {
    init_tracing();
    let config = DbConfig::from_env();
    let channel = Channel::new("ch_cachewatch_test_cache");

    let queue = EventQueue::new();
    queue
        .connect(&PgNotificationSource::from_config(&config), channel.clone())
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = MemoizingCache::new(Greedy::new(queue.clone()), move |_: ()| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<usize, String>(n) }
    });
    assert_eq!(cache.call(()).await, Ok(0));
    assert_eq!(cache.call(()).await, Ok(0));

    let client = connect(&config).await.unwrap();
    emit_event(&client, &EventBuilder::new().channel(channel).build())
        .await
        .unwrap();
    wait_until(|| queue.size() == 1).await;

    assert_eq!(cache.call(()).await, Ok(1));
}

#[tokio::test]
async fn test_unreachable_server_fails_connect() {
    let source = PgNotificationSource::new("host=127.0.0.1 port=1 user=nobody connect_timeout=1");
    let queue = EventQueue::new();
    assert!(queue.connect(&source, Channel::default()).await.is_err());
    assert!(queue.channel().is_none());
}
