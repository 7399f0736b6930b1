//! The warp server: NIP-01 over WebSocket plus the HTTP surfaces.
//!
//! A single port serves four things:
//!
//! - the relay protocol on WebSocket upgrades of `/`
//! - the NIP-11 information document on `Accept: application/nostr+json`
//! - `/api/v1/stats`: every registered stats provider plus the app block
//! - `/api/v1/health`: the ordered health document, status-mapped
//!
//! Each connection keeps its subscriptions in a map fed from two sides:
//! stored events streamed out of the query pool, and live events arriving
//! through the mirror sink.

use crate::classify::RequestContext;
use crate::policy::{validate_event_caps, Policy};
use crate::store::AggregateStore;
use crate::{PROJECT_NAME, VERSION};
use futures_util::{SinkExt, StreamExt};
use prism_client::{BroadcastSystem, MirrorManager, QueryPool};
use prism_core::{
    verify_event, ClientMessage, Event, Filter, RelayInformationDocument, RelayMessage,
    RELAY_INFO_ACCEPT_HEADER,
};
use prism_utils::{registry, HealthState, JsonObject, JsonValue};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::Filter as WarpFilter;

/// Deadline for one save fan-out.
const SAVE_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for one query fan-out.
const QUERY_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for one count dispatch.
const COUNT_DEADLINE: Duration = Duration::from_secs(10);

/// Shared state behind every route.
pub struct ServerState {
    pub store: Arc<AggregateStore>,
    pub pool: Arc<QueryPool>,
    pub broadcast: Option<Arc<BroadcastSystem>>,
    pub mirror: Arc<MirrorManager>,
    pub policy: Arc<Policy>,
    pub mirror_sink: broadcast::Sender<Event>,
    pub info: RelayInformationDocument,
    pub service_url: Option<String>,
    pub started_at: Instant,
}

struct SubEntry {
    filters: Vec<Filter>,
    cancel: CancellationToken,
}

type Subscriptions = Arc<Mutex<HashMap<String, SubEntry>>>;

/// Build the full route tree.
pub fn routes(
    state: Arc<ServerState>,
) -> impl WarpFilter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ws_state = Arc::clone(&state);
    let websocket = warp::path::end()
        .and(warp::ws())
        .and(warp::addr::remote())
        .map(move |ws: Ws, addr: Option<SocketAddr>| {
            let state = Arc::clone(&ws_state);
            ws.on_upgrade(move |socket| handle_connection(socket, addr, state))
        });

    let landing_state = Arc::clone(&state);
    let landing = warp::path::end()
        .and(warp::get())
        .and(warp::header::optional::<String>("accept"))
        .map(move |accept: Option<String>| {
            let state = Arc::clone(&landing_state);
            if accept
                .as_deref()
                .map(|a| a.contains(RELAY_INFO_ACCEPT_HEADER))
                .unwrap_or(false)
            {
                nip11_reply(&state)
            } else {
                landing_reply(&state)
            }
        });

    let stats_state = Arc::clone(&state);
    let stats = warp::path!("api" / "v1" / "stats")
        .and(warp::get())
        .map(move || stats_reply(&stats_state));

    let health_state = Arc::clone(&state);
    let health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .map(move || health_reply(&health_state));

    websocket.or(stats).or(health).or(landing)
}

fn json_response(body: String, content_type: &'static str, status: StatusCode) -> warp::reply::Response {
    warp::http::Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Access-Control-Allow-Origin", "*")
        .body(body.into())
        .unwrap_or_default()
}

fn nip11_reply(state: &ServerState) -> warp::reply::Response {
    let body = serde_json::to_string(&state.info).unwrap_or_else(|_| "{}".to_string());
    json_response(body, "application/nostr+json", StatusCode::OK)
}

fn landing_reply(state: &ServerState) -> warp::reply::Response {
    let name = state.info.name.as_deref().unwrap_or(PROJECT_NAME);
    let description = state
        .info
        .description
        .as_deref()
        .unwrap_or("A Nostr relay aggregator.");
    let nips = state
        .info
        .supported_nips
        .as_ref()
        .map(|nips| {
            nips.iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    let endpoint = state
        .service_url
        .as_deref()
        .unwrap_or("this endpoint's WebSocket");
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{name}</title></head>
<body>
<h1>{name}</h1>
<p>{description}</p>
<p>Connect with a Nostr client: <code>{endpoint}</code></p>
<p>Supported NIPs: {nips}</p>
<p>Version: {VERSION} &middot; <a href="/api/v1/stats">stats</a> &middot; <a href="/api/v1/health">health</a></p>
</body>
</html>"#
    );
    warp::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(body.into())
        .unwrap_or_default()
}

fn stats_reply(state: &ServerState) -> warp::reply::Response {
    let mut root = match registry().all_stats() {
        JsonValue::Object(obj) => obj,
        _ => JsonObject::new(),
    };

    let tasks = tokio::runtime::Handle::current()
        .metrics()
        .num_alive_tasks();
    let mut task_obj = JsonObject::new();
    task_obj
        .set("count", tasks)
        .set("health_state", HealthState::from_task_count(tasks).as_str());

    let mut memory = JsonObject::new();
    match rss_bytes() {
        Some(rss) => memory.set("rss_bytes", rss),
        None => memory.set("rss_bytes", JsonValue::Null),
    };

    let mut app = JsonObject::new();
    app.set("version", VERSION)
        .set("uptime_seconds", state.started_at.elapsed().as_secs())
        .set("tasks", JsonValue::Object(task_obj))
        .set("memory", JsonValue::Object(memory));
    root.set("app", JsonValue::Object(app));

    json_response(
        JsonValue::Object(root).to_json_pretty(),
        "application/json",
        StatusCode::OK,
    )
}

fn health_reply(state: &ServerState) -> warp::reply::Response {
    let publish_state = state.store.publish_health();
    let query_state = state.store.query_health();
    let mirror_failures = state.mirror.consecutive_mirror_failures();
    let mirror_state = HealthState::from_consecutive_failures(mirror_failures);
    let broadcast_failures = state
        .broadcast
        .as_ref()
        .map(|b| b.consecutive_broadcast_failures())
        .unwrap_or(0);
    let broadcast_state = HealthState::from_consecutive_failures(broadcast_failures);
    let tasks = tokio::runtime::Handle::current()
        .metrics()
        .num_alive_tasks();
    let main_state = HealthState::worst([
        publish_state,
        query_state,
        mirror_state,
        broadcast_state,
        HealthState::from_task_count(tasks),
    ]);

    let service = state
        .info
        .name
        .clone()
        .unwrap_or_else(|| PROJECT_NAME.to_string());
    let mut obj = JsonObject::new();
    obj.set("status", main_state.status_word())
        .set("service", service)
        .set("version", VERSION)
        .set("main_health_state", main_state.as_str())
        .set("publish_health_state", publish_state.as_str())
        .set("query_health_state", query_state.as_str())
        .set("mirror_health_state", mirror_state.as_str())
        .set("broadcast_health_state", broadcast_state.as_str())
        .set(
            "consecutive_publish_failures",
            state.store.consecutive_publish_failures(),
        )
        .set(
            "consecutive_query_failures",
            state.pool.consecutive_query_failures(),
        )
        .set("consecutive_mirror_failures", mirror_failures)
        .set("consecutive_broadcast_failures", broadcast_failures);

    let status =
        StatusCode::from_u16(main_state.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(
        JsonValue::Object(obj).to_json_pretty(),
        "application/json",
        status,
    )
}

/// Resident set size from procfs; `None` off Linux.
fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

async fn handle_connection(socket: WebSocket, addr: Option<SocketAddr>, state: Arc<ServerState>) {
    let ip = addr
        .map(|a| a.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if !state.policy.check_connection(ip) {
        debug!(%ip, "connection rejected by rate limit");
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

    // live feed: mirror events fan out to every matching subscription
    let mut mirror_rx = state.mirror_sink.subscribe();
    let live_subs = Arc::clone(&subscriptions);
    let live_tx = out_tx.clone();
    let live_feed = tokio::spawn(async move {
        loop {
            match mirror_rx.recv().await {
                Ok(event) => {
                    let subs = live_subs.lock().await;
                    for (sub_id, entry) in subs.iter() {
                        if entry.filters.iter().any(|f| f.matches(&event)) {
                            send_relay_message(
                                &live_tx,
                                &RelayMessage::Event {
                                    subscription_id: sub_id.clone(),
                                    event: event.clone(),
                                },
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged behind the mirror feed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%ip, error = %e, "websocket error");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        let Ok(text) = frame.to_str() else { continue };

        match ClientMessage::from_json(text) {
            Ok(ClientMessage::Event { event }) => {
                handle_event(&state, &out_tx, event).await;
            }
            Ok(ClientMessage::Req {
                subscription_id,
                filters,
            }) => {
                handle_req(&state, &out_tx, &subscriptions, ip, subscription_id, filters).await;
            }
            Ok(ClientMessage::Count {
                subscription_id,
                filters,
            }) => {
                handle_count(&state, &out_tx, ip, subscription_id, filters).await;
            }
            Ok(ClientMessage::Close { subscription_id }) => {
                if let Some(entry) = subscriptions.lock().await.remove(&subscription_id) {
                    entry.cancel.cancel();
                }
            }
            Ok(ClientMessage::Auth { .. }) => {
                // this relay never demands auth from its own clients
                send_relay_message(
                    &out_tx,
                    &RelayMessage::Notice {
                        message: "auth not required".to_string(),
                    },
                );
            }
            Err(e) => {
                send_relay_message(
                    &out_tx,
                    &RelayMessage::Notice {
                        message: format!("invalid: {e}"),
                    },
                );
            }
        }
    }

    for (_, entry) in subscriptions.lock().await.drain() {
        entry.cancel.cancel();
    }
    live_feed.abort();
    writer.abort();
    debug!(%ip, "connection closed");
}

fn send_relay_message(out_tx: &mpsc::UnboundedSender<Message>, msg: &RelayMessage) {
    if let Ok(text) = msg.to_json() {
        let _ = out_tx.send(Message::text(text));
    }
}

async fn handle_event(
    state: &Arc<ServerState>,
    out_tx: &mpsc::UnboundedSender<Message>,
    event: Event,
) {
    let event_id = event.id.clone();
    let reply = |accepted: bool, message: String| RelayMessage::Ok {
        event_id: event_id.clone(),
        accepted,
        message,
    };

    if let Err(rejection) = validate_event_caps(&event) {
        send_relay_message(out_tx, &reply(false, rejection));
        return;
    }
    match verify_event(&event) {
        Ok(true) => {}
        _ => {
            send_relay_message(
                out_tx,
                &reply(false, "invalid: signature verification failed".to_string()),
            );
            return;
        }
    }

    // deletion bookkeeping: the lookup stays local, the classifier keeps it
    // off the upstream peers
    let deletion_check: Filter = Filter {
        kinds: Some(vec![prism_core::KIND_DELETION]),
        tags: [("#e".to_string(), vec![event.id.clone()])]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    let mut check = state
        .store
        .query_events(&RequestContext::default(), deletion_check, SAVE_DEADLINE)
        .await;
    if check.events.recv().await.is_some() {
        send_relay_message(
            out_tx,
            &reply(false, "blocked: event was deleted".to_string()),
        );
        return;
    }

    match state.store.save_event(&event, SAVE_DEADLINE).await {
        Ok(()) => send_relay_message(out_tx, &reply(true, String::new())),
        Err(e) => {
            warn!(event = %event.id, error = %e, "save failed");
            send_relay_message(out_tx, &reply(false, e.to_string()));
        }
    }
}

async fn handle_req(
    state: &Arc<ServerState>,
    out_tx: &mpsc::UnboundedSender<Message>,
    subscriptions: &Subscriptions,
    ip: IpAddr,
    subscription_id: String,
    filters: Vec<Filter>,
) {
    for _ in &filters {
        if !state.policy.check_filter(ip) {
            send_relay_message(
                out_tx,
                &RelayMessage::Closed {
                    subscription_id: subscription_id.clone(),
                    message: "rate-limited: too many filters".to_string(),
                },
            );
            return;
        }
    }

    let cancel = CancellationToken::new();
    {
        let mut subs = subscriptions.lock().await;
        if let Some(previous) = subs.insert(
            subscription_id.clone(),
            SubEntry {
                filters: filters.clone(),
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }
    }

    let state = Arc::clone(state);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let ctx = RequestContext::subscription(&subscription_id);
        for filter in filters {
            let mut stream = state.store.query_events(&ctx, filter, QUERY_DEADLINE).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = stream.events.recv() => match event {
                        Some(event) => send_relay_message(
                            &out_tx,
                            &RelayMessage::Event {
                                subscription_id: subscription_id.clone(),
                                event,
                            },
                        ),
                        None => break,
                    }
                }
            }
        }
        send_relay_message(&out_tx, &RelayMessage::Eose { subscription_id });
    });
}

async fn handle_count(
    state: &Arc<ServerState>,
    out_tx: &mpsc::UnboundedSender<Message>,
    ip: IpAddr,
    subscription_id: String,
    filters: Vec<Filter>,
) {
    for _ in &filters {
        if !state.policy.check_filter(ip) {
            send_relay_message(
                out_tx,
                &RelayMessage::Closed {
                    subscription_id: subscription_id.clone(),
                    message: "rate-limited: too many filters".to_string(),
                },
            );
            return;
        }
    }

    let ctx = RequestContext::subscription(&subscription_id);
    let mut total = 0u64;
    for filter in filters {
        total += state.store.count_events(&ctx, filter, COUNT_DEADLINE).await;
    }
    send_relay_message(
        out_tx,
        &RelayMessage::Count {
            subscription_id,
            count: total,
        },
    );
}
