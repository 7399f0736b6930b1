//! Server-level tests: HTTP surfaces and the NIP-01 WebSocket path.

use futures_util::{SinkExt, StreamExt};
use prism_client::{
    BroadcastConfig, BroadcastSystem, MirrorManager, QueryPool, SessionRegistry,
};
use prism_core::{
    finalize_event, generate_secret_key, now_timestamp, parse_secret_key, ClientMessage, Event,
    EventTemplate, RelayMessage,
};
use prism_relay::{routes, AggregateStore, Policy, ServerState};
use prism_utils::JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

const SAVE_DEADLINE: Duration = Duration::from_secs(5);

fn signed_event(content: &str) -> Event {
    let secret = parse_secret_key(&generate_secret_key()).unwrap();
    finalize_event(
        &EventTemplate {
            created_at: now_timestamp(),
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        },
        &secret,
    )
    .unwrap()
}

async fn test_state(broadcast_targets: Vec<String>) -> Arc<ServerState> {
    let registry = Arc::new(SessionRegistry::new(None));
    let pool = Arc::new(QueryPool::new(Arc::clone(&registry), vec![]));

    let broadcast_system = if broadcast_targets.is_empty() {
        None
    } else {
        let system = BroadcastSystem::new(
            BroadcastConfig {
                mandatory_relays: broadcast_targets,
                workers: 2,
                ..Default::default()
            },
            Arc::clone(&registry),
        );
        system.start().await;
        Some(system)
    };

    let (mirror_sink, _) = broadcast::channel(64);
    let mirror = MirrorManager::new(vec![], Arc::clone(&registry), mirror_sink.clone());
    let store = AggregateStore::new(Arc::clone(&pool), broadcast_system.clone());

    let mut info = prism_core::RelayInformationDocument {
        name: Some("prism-test".to_string()),
        ..Default::default()
    };
    info.ensure_nips(&[11, 42, 45]);

    Arc::new(ServerState {
        store,
        pool,
        broadcast: broadcast_system,
        mirror,
        policy: Arc::new(Policy::default()),
        mirror_sink,
        info,
        service_url: None,
        started_at: Instant::now(),
    })
}

/// Minimal accept-everything upstream used to flip health back to green.
async fn spawn_accepting_relay() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(frame)) = ws.next().await {
                    let tokio_tungstenite::tungstenite::Message::Text(text) = frame else {
                        continue;
                    };
                    if let Ok(ClientMessage::Event { event }) = ClientMessage::from_json(&text) {
                        let ok = RelayMessage::Ok {
                            event_id: event.id,
                            accepted: true,
                            message: String::new(),
                        };
                        let _ = ws
                            .send(tokio_tungstenite::tungstenite::Message::Text(
                                ok.to_json().unwrap().into(),
                            ))
                            .await;
                    }
                }
            });
        }
    });
    (url, handle)
}

#[tokio::test]
async fn nip11_document_on_accept_header() {
    let state = test_state(vec![]).await;
    let response = warp::test::request()
        .path("/")
        .header("accept", "application/nostr+json")
        .reply(&routes(state))
        .await;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/nostr+json"
    );
    let body = String::from_utf8_lossy(response.body());
    let doc: prism_core::RelayInformationDocument = serde_json::from_str(&body).unwrap();
    assert!(doc.supports_nip(11));
    assert!(doc.supports_nip(42));
    assert!(doc.supports_nip(45));
}

#[tokio::test]
async fn landing_page_without_accept_header() {
    let state = test_state(vec![]).await;
    let response = warp::test::request().path("/").reply(&routes(state)).await;
    assert_eq!(response.status(), 200);
    let body = String::from_utf8_lossy(response.body());
    assert!(body.contains("<html>"));
    assert!(body.contains("prism-test"));
}

#[tokio::test]
async fn health_document_is_ordered_and_green() {
    let state = test_state(vec![]).await;
    let response = warp::test::request()
        .path("/api/v1/health")
        .reply(&routes(state))
        .await;

    assert_eq!(response.status(), 200);
    let body = String::from_utf8_lossy(response.body()).to_string();
    let order = [
        "\"status\"",
        "\"service\"",
        "\"version\"",
        "\"main_health_state\"",
        "\"publish_health_state\"",
        "\"query_health_state\"",
        "\"mirror_health_state\"",
        "\"broadcast_health_state\"",
        "\"consecutive_publish_failures\"",
        "\"consecutive_query_failures\"",
        "\"consecutive_mirror_failures\"",
        "\"consecutive_broadcast_failures\"",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|field| body.find(field).expect(field))
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "health fields must keep their order");
    assert!(body.contains("\"main_health_state\": \"GREEN\""));
}

#[tokio::test]
async fn health_goes_red_after_consecutive_failures_and_recovers() {
    // no listener on this port: every save fails
    let state = test_state(vec!["ws://127.0.0.1:1".to_string()]).await;
    let filter = routes(Arc::clone(&state));

    let event = signed_event("health probe");
    for _ in 0..10 {
        let _ = state.store.save_event(&event, SAVE_DEADLINE).await;
    }
    assert_eq!(state.store.consecutive_publish_failures(), 10);

    let response = warp::test::request()
        .path("/api/v1/health")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), 503);
    let body = String::from_utf8_lossy(response.body());
    assert!(body.contains("\"publish_health_state\": \"RED\""));

    // one accepted save resets the counter and the endpoint
    let (url, upstream) = spawn_accepting_relay().await;
    let recovered = test_state(vec![url]).await;
    let fresh = signed_event("recovery");
    recovered
        .store
        .save_event(&fresh, SAVE_DEADLINE)
        .await
        .unwrap();
    assert_eq!(recovered.store.consecutive_publish_failures(), 0);
    let response = warp::test::request()
        .path("/api/v1/health")
        .reply(&routes(recovered))
        .await;
    assert_eq!(response.status(), 200);
    upstream.abort();
}

#[tokio::test]
async fn stats_round_trip_is_byte_identical() {
    let state = test_state(vec![]).await;
    let response = warp::test::request()
        .path("/api/v1/stats")
        .reply(&routes(state))
        .await;
    assert_eq!(response.status(), 200);

    let body = String::from_utf8_lossy(response.body()).to_string();
    let parsed = JsonValue::from_json(&body).unwrap();
    assert_eq!(parsed.to_json_pretty(), body);

    let root = parsed.as_object().unwrap();
    let app = root.get("app").and_then(JsonValue::as_object).unwrap();
    assert!(app.get("version").is_some());
    assert!(app.get("uptime_seconds").is_some());
    assert!(app.get("tasks").is_some());
}

#[tokio::test]
async fn websocket_req_yields_eose_and_count_yields_zero() {
    let state = test_state(vec![]).await;
    let mut client = warp::test::ws()
        .path("/")
        .handshake(routes(state))
        .await
        .unwrap();

    client
        .send_text(r#"["REQ","sub1",{"kinds":[1]}]"#)
        .await;
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.to_str().unwrap(), r#"["EOSE","sub1"]"#);

    client
        .send_text(r#"["COUNT","c1",{"kinds":[1]}]"#)
        .await;
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.to_str().unwrap(), r#"["COUNT","c1",{"count":0}]"#);
}

#[tokio::test]
async fn websocket_rejects_invalid_events() {
    let state = test_state(vec![]).await;
    let mut client = warp::test::ws()
        .path("/")
        .handshake(routes(state))
        .await
        .unwrap();

    // structurally fine but unsigned
    let mut event = signed_event("tampered");
    event.sig = "00".repeat(64);
    let frame = ClientMessage::Event { event }.to_json().unwrap();
    client.send_text(frame).await;
    let reply = client.recv().await.unwrap();
    let text = reply.to_str().unwrap();
    assert!(text.starts_with(r#"["OK","#));
    assert!(text.contains("invalid: signature verification failed"));

    // oversized tag set is blocked before any signature check
    let mut spam = signed_event("spam");
    spam.tags = (0..101).map(|i| vec!["t".to_string(), i.to_string()]).collect();
    let frame = ClientMessage::Event { event: spam }.to_json().unwrap();
    client.send_text(frame).await;
    let reply = client.recv().await.unwrap();
    assert!(reply.to_str().unwrap().contains("blocked: too many tags"));
}

#[tokio::test]
async fn websocket_accepts_signed_event_without_broadcast_peers() {
    let state = test_state(vec![]).await;
    let mut client = warp::test::ws()
        .path("/")
        .handshake(routes(state))
        .await
        .unwrap();

    let event = signed_event("accepted");
    let id = event.id.clone();
    client
        .send_text(ClientMessage::Event { event }.to_json().unwrap())
        .await;
    let reply = client.recv().await.unwrap();
    assert_eq!(
        reply.to_str().unwrap(),
        format!(r#"["OK","{id}",true,""]"#)
    );
}

#[tokio::test]
async fn websocket_garbage_yields_notice() {
    let state = test_state(vec![]).await;
    let mut client = warp::test::ws()
        .path("/")
        .handshake(routes(state))
        .await
        .unwrap();

    client.send_text("not json").await;
    let reply = client.recv().await.unwrap();
    assert!(reply.to_str().unwrap().starts_with(r#"["NOTICE","#));
}

#[tokio::test]
async fn live_subscription_receives_mirrored_events() {
    let state = test_state(vec![]).await;
    let mut client = warp::test::ws()
        .path("/")
        .handshake(routes(Arc::clone(&state)))
        .await
        .unwrap();

    client
        .send_text(r#"["REQ","live",{"kinds":[1]}]"#)
        .await;
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.to_str().unwrap(), r#"["EOSE","live"]"#);

    let event = signed_event("pushed through the mirror");
    state.mirror_sink.send(event.clone()).unwrap();

    let reply = timeout(Duration::from_secs(5), client.recv())
        .await
        .unwrap()
        .unwrap();
    let text = reply.to_str().unwrap();
    assert!(text.starts_with(r#"["EVENT","live","#));
    assert!(text.contains(&event.id));

    // a kind the filter excludes stays silent
    let mut off_filter = signed_event("filtered out");
    off_filter.kind = 7;
    state.mirror_sink.send(off_filter).unwrap();
    let nothing = timeout(Duration::from_millis(300), client.recv()).await;
    assert!(nothing.is_err());
}
