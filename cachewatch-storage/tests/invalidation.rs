//! Memoization driven by real event queues and strategies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachewatch_events::{
    Channel, ChannelSource, EventQueue, EventQueueProtocol, Greedy, Operation, Timed, Windowed,
};
use cachewatch_storage::{CallArgs, MemoizingCache};
use cachewatch_test_utils::{fixtures, fixtures::EventBuilder, init_tracing, ScriptedQueue};
use chrono::{TimeDelta, Utc};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_change_notification_invalidates_cache() {
    init_tracing();
    let (source, publisher) = ChannelSource::new();
    let queue = EventQueue::new();
    queue.connect(&source, Channel::default()).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = MemoizingCache::new(Greedy::new(queue.clone()), move |id: i64| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<String, String>(format!("user {} v{}", id, n)) }
    });

    assert_eq!(cache.call(1).await.unwrap(), "user 1 v0");
    assert_eq!(cache.call(1).await.unwrap(), "user 1 v0");

    publisher
        .publish(EventBuilder::new().table("users").operation(Operation::Update).payload())
        .unwrap();
    wait_until(|| queue.size() == 1).await;

    assert_eq!(cache.call(1).await.unwrap(), "user 1 v1");
    assert_eq!(cache.call(1).await.unwrap(), "user 1 v1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().clears, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminated_connection_fails_open() {
    init_tracing();
    let (source, publisher) = ChannelSource::new();
    let queue = EventQueue::new();
    queue.connect(&source, Channel::default()).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = MemoizingCache::new(Greedy::new(queue.clone()), move |_: ()| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), String>(()) }
    });

    cache.call(()).await.unwrap();
    cache.call(()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(publisher);
    wait_until(|| !queue.connection_healthy()).await;

    cache.call(()).await.unwrap();
    cache.call(()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.stats().bypasses, 2);
}

#[tokio::test]
async fn test_unbound_queue_never_caches() {
    let queue = EventQueue::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = MemoizingCache::new(Greedy::new(queue), move |x: u8| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<u8, String>(x) }
    });

    for _ in 0..3 {
        cache.call(9).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_windowed_strategy_clears_on_sequence() {
    let queue = Arc::new(ScriptedQueue::new());
    let strategy = Windowed::new(
        queue.clone() as Arc<dyn EventQueueProtocol>,
        vec![Operation::Insert, Operation::Delete],
    )
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = MemoizingCache::new(strategy, move |_: u8| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), String>(()) }
    });

    cache.call(0).await.unwrap();
    queue.push_all(fixtures::events(&[Operation::Insert]));
    cache.call(0).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    queue.push_all(fixtures::events(&[Operation::Delete]));
    cache.call(0).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timed_strategy_rate_limits_clears() {
    let anchor = Utc::now();
    let queue = Arc::new(ScriptedQueue::new());
    let strategy = Timed::anchored_at(queue.clone(), Duration::from_millis(100), anchor);
    let cache = MemoizingCache::new(strategy, |_: u8| async { Ok::<(), String>(()) });

    cache.call(0).await.unwrap();
    for ms in [150, 170, 190] {
        queue.push(
            EventBuilder::new()
                .sent_at(anchor + TimeDelta::milliseconds(ms))
                .build(),
        );
        cache.call(0).await.unwrap();
    }
    // Only the first event is more than 100ms past its predecessor trigger.
    assert_eq!(cache.stats().clears, 1);
}

#[tokio::test]
async fn test_keyword_order_shares_entry() {
    let queue = Arc::new(ScriptedQueue::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = MemoizingCache::new(Greedy::new(queue), move |args: CallArgs| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<usize, String>(args.kwargs().len()) }
    });

    let first = CallArgs::new().arg("orders").kwarg("limit", 10).kwarg("desc", true);
    let second = CallArgs::new().arg("orders").kwarg("desc", true).kwarg("limit", 10);
    assert_eq!(cache.call(first).await, Ok(2));
    assert_eq!(cache.call(second).await, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
}
