//! End-to-end aggregator tests against in-process mock relays.

mod common;

use common::{sample_event, spawn_mock_relay, MockBehavior, PublishBehavior};
use prism_client::{
    BroadcastConfig, BroadcastSystem, MirrorManager, QueryPool, SessionRegistry,
};
use prism_core::{parse_secret_key, Filter};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(5);

fn registry() -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(None))
}

async fn started_system(
    mandatory: Vec<String>,
    registry: Arc<SessionRegistry>,
) -> Arc<BroadcastSystem> {
    let system = BroadcastSystem::new(
        BroadcastConfig {
            mandatory_relays: mandatory,
            workers: 4,
            ..Default::default()
        },
        registry,
    );
    system.start().await;
    system
}

#[tokio::test]
async fn publish_fanout_partial_failure_succeeds() {
    let accepting = spawn_mock_relay(MockBehavior::default()).await;
    let rejecting = spawn_mock_relay(MockBehavior {
        publish: PublishBehavior::Reject("rate-limited: slow down"),
        ..Default::default()
    })
    .await;
    let dead_url = "ws://127.0.0.1:1".to_string();

    let system = started_system(
        vec![accepting.url.clone(), rejecting.url.clone(), dead_url],
        registry(),
    )
    .await;

    let event = sample_event("partial failure");
    system.broadcast(&event, DEADLINE).await.unwrap();

    assert_eq!(system.successes(), 1);
    assert_eq!(system.failures(), 2);
    assert_eq!(system.consecutive_broadcast_failures(), 0);

    // the accepted event is cached, so a second arrival is suppressed
    system.broadcast(&event, DEADLINE).await.unwrap();
    assert_eq!(accepting.publishes_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn publish_all_fail_surfaces_a_prefixed_error() {
    let duplicate = spawn_mock_relay(MockBehavior {
        publish: PublishBehavior::Reject("duplicate: already have it"),
        ..Default::default()
    })
    .await;
    let blocked = spawn_mock_relay(MockBehavior {
        publish: PublishBehavior::Reject("blocked: spam"),
        ..Default::default()
    })
    .await;

    let system = started_system(
        vec![duplicate.url.clone(), blocked.url.clone()],
        registry(),
    )
    .await;

    let event = sample_event("all fail");
    let err = system.broadcast(&event, DEADLINE).await.unwrap_err();
    let rejection = err.prefixed().expect("expected a prefixed error");
    assert!(["duplicate", "blocked"].contains(&rejection.prefix.as_str()));
    assert!(
        rejection.relay_url == duplicate.url || rejection.relay_url == blocked.url,
        "rejection should name a peer url"
    );
    assert_eq!(system.consecutive_broadcast_failures(), 1);
}

#[tokio::test]
async fn publish_auth_retry_happens_exactly_once() {
    let relay = spawn_mock_relay(MockBehavior {
        publish: PublishBehavior::RequireAuth,
        ..Default::default()
    })
    .await;

    let secret = parse_secret_key(&prism_core::generate_secret_key()).unwrap();
    let registry = Arc::new(SessionRegistry::new(Some(secret)));
    let system = started_system(vec![relay.url.clone()], registry).await;

    let event = sample_event("auth retry");
    system.broadcast(&event, DEADLINE).await.unwrap();

    assert_eq!(system.successes(), 1);
    // first attempt rejected with auth-required, second accepted after AUTH
    assert_eq!(relay.publishes_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn query_merges_and_dedups_across_peers() {
    let shared = sample_event("shared");
    let only_a = sample_event("only on a");
    let only_b = sample_event("only on b");

    let relay_a = spawn_mock_relay(MockBehavior {
        stored_events: vec![shared.clone(), only_a.clone()],
        ..Default::default()
    })
    .await;
    let relay_b = spawn_mock_relay(MockBehavior {
        stored_events: vec![shared.clone(), only_b.clone()],
        ..Default::default()
    })
    .await;

    let pool = QueryPool::new(
        registry(),
        vec![relay_a.url.clone(), relay_b.url.clone()],
    );
    let mut stream = pool.query(Filter::default(), DEADLINE).await;

    let mut ids = Vec::new();
    while let Some(event) = timeout(DEADLINE, stream.events.recv()).await.unwrap() {
        ids.push(event.id);
    }

    assert_eq!(ids.len(), 3, "duplicate event must appear once");
    assert!(ids.contains(&shared.id));
    assert!(ids.contains(&only_a.id));
    assert!(ids.contains(&only_b.id));
    assert_eq!(pool.consecutive_query_failures(), 0);
}

#[tokio::test]
async fn query_isolates_dead_peers() {
    let live = spawn_mock_relay(MockBehavior {
        stored_events: vec![sample_event("from the live peer")],
        ..Default::default()
    })
    .await;

    let pool = QueryPool::new(
        registry(),
        vec![live.url.clone(), "ws://127.0.0.1:1".to_string()],
    );
    let mut stream = pool.query(Filter::default(), DEADLINE).await;

    let mut received = 0;
    while let Some(_) = timeout(DEADLINE, stream.events.recv()).await.unwrap() {
        received += 1;
    }
    assert_eq!(received, 1);
    assert_eq!(pool.query_failures(), 1);
    assert_eq!(pool.consecutive_query_failures(), 1);
}

#[tokio::test]
async fn count_uses_only_the_countable_subset() {
    let countable = spawn_mock_relay(MockBehavior {
        count: 238,
        ..Default::default()
    })
    .await;
    let uncountable = spawn_mock_relay(MockBehavior {
        count: 999,
        ..Default::default()
    })
    .await;

    let pool = QueryPool::new(
        registry(),
        vec![countable.url.clone(), uncountable.url.clone()],
    );
    pool.set_countable(vec![countable.url.clone()]);

    let total = pool.count(Filter::default(), DEADLINE).await;
    assert_eq!(total, 238);
}

#[tokio::test]
async fn count_without_countable_peers_returns_zero() {
    let pool = QueryPool::new(registry(), vec!["ws://127.0.0.1:1".to_string()]);
    assert_eq!(pool.count(Filter::default(), DEADLINE).await, 0);
}

#[tokio::test]
async fn count_failure_returns_zero_without_error() {
    let pool = QueryPool::new(registry(), vec!["ws://127.0.0.1:1".to_string()]);
    pool.set_countable(vec!["ws://127.0.0.1:1".to_string()]);
    assert_eq!(pool.count(Filter::default(), DEADLINE).await, 0);
    assert_eq!(pool.count_failures(), 1);
}

#[tokio::test]
async fn cancellation_closes_the_stream() {
    let relay = spawn_mock_relay(MockBehavior {
        stored_events: vec![sample_event("one")],
        ..Default::default()
    })
    .await;

    let pool = QueryPool::new(registry(), vec![relay.url.clone()]);
    let mut stream = pool.query(Filter::default(), Duration::from_secs(60)).await;
    stream.cancel.cancel();

    // the stream must end promptly rather than waiting out the deadline
    let drained = timeout(Duration::from_secs(2), async {
        while stream.events.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn mirror_health_trips_only_past_half_dead() {
    let live = spawn_mock_relay(MockBehavior::default()).await;
    let (sink, _) = broadcast::channel(8);

    // one of two dead: exactly half, still green
    let mirror = MirrorManager::new(
        vec![live.url.clone(), "ws://127.0.0.1:1".to_string()],
        registry(),
        sink.clone(),
    );
    mirror.check_peer_health().await;
    assert_eq!(mirror.peer_counts(), (1, 1));
    assert_eq!(mirror.consecutive_mirror_failures(), 0);

    // two of three dead: more than half, counter trips until a clean pass
    let shaky = MirrorManager::new(
        vec![
            live.url.clone(),
            "ws://127.0.0.1:1".to_string(),
            "ws://127.0.0.1:2".to_string(),
        ],
        registry(),
        sink,
    );
    shaky.check_peer_health().await;
    assert_eq!(shaky.consecutive_mirror_failures(), 1);
    shaky.check_peer_health().await;
    assert_eq!(shaky.consecutive_mirror_failures(), 2);
}

#[tokio::test]
async fn mirror_forwards_live_events_to_the_sink() {
    let live_event = sample_event("mirrored");
    let relay = spawn_mock_relay(MockBehavior {
        stored_events: vec![live_event.clone()],
        ..Default::default()
    })
    .await;

    let (sink, mut sink_rx) = broadcast::channel(16);
    let mirror = MirrorManager::new(vec![relay.url.clone()], registry(), sink);
    mirror.start().await.unwrap();

    let received = timeout(DEADLINE, sink_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.id, live_event.id);

    mirror.close().await;
}
