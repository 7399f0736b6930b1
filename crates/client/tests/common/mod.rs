//! In-process mock relay for integration tests.
//!
//! Speaks just enough NIP-01 to exercise the aggregator: OK verdicts with
//! configurable messages, canned REQ replies followed by EOSE, COUNT
//! responses, and an optional NIP-42 challenge demanded before acceptance.

use futures_util::{SinkExt, StreamExt};
use prism_core::{ClientMessage, Event, RelayMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// How the mock responds to EVENT frames.
#[derive(Debug, Clone)]
pub enum PublishBehavior {
    Accept,
    Reject(&'static str),
    /// Reject with `auth-required` until the session has authenticated.
    RequireAuth,
}

/// One scripted upstream relay.
#[derive(Clone)]
pub struct MockBehavior {
    pub publish: PublishBehavior,
    /// Events served to any REQ, followed by EOSE.
    pub stored_events: Vec<Event>,
    /// COUNT reply.
    pub count: u64,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            publish: PublishBehavior::Accept,
            stored_events: Vec::new(),
            count: 0,
        }
    }
}

pub struct MockRelay {
    pub url: String,
    /// EVENT frames seen across all connections.
    pub publishes_seen: Arc<AtomicU64>,
    /// REQ frames seen across all connections.
    pub reqs_seen: Arc<AtomicU64>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_mock_relay(behavior: MockBehavior) -> MockRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let publishes_seen = Arc::new(AtomicU64::new(0));
    let reqs_seen = Arc::new(AtomicU64::new(0));

    let publishes = Arc::clone(&publishes_seen);
    let reqs = Arc::clone(&reqs_seen);
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let behavior = behavior.clone();
            let publishes = Arc::clone(&publishes);
            let reqs = Arc::clone(&reqs);
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                serve_connection(ws, behavior, publishes, reqs).await;
            });
        }
    });

    MockRelay {
        url: format!("ws://{addr}"),
        publishes_seen,
        reqs_seen,
        handle,
    }
}

async fn serve_connection(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    behavior: MockBehavior,
    publishes: Arc<AtomicU64>,
    reqs: Arc<AtomicU64>,
) {
    let mut authed = false;

    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(msg) = ClientMessage::from_json(&text) else {
            continue;
        };
        let replies = match msg {
            ClientMessage::Event { event } => {
                publishes.fetch_add(1, Ordering::SeqCst);
                let (accepted, message) = match &behavior.publish {
                    PublishBehavior::Accept => (true, String::new()),
                    PublishBehavior::Reject(message) => (false, message.to_string()),
                    PublishBehavior::RequireAuth => {
                        if authed {
                            (true, String::new())
                        } else {
                            (false, "auth-required: need auth".to_string())
                        }
                    }
                };
                let mut replies = vec![RelayMessage::Ok {
                    event_id: event.id,
                    accepted,
                    message,
                }];
                // the challenge rides along with the rejection, the way a
                // relay demanding auth on demand would issue it
                if !accepted && matches!(behavior.publish, PublishBehavior::RequireAuth) {
                    replies.push(RelayMessage::Auth {
                        challenge: "mock-challenge".to_string(),
                    });
                }
                replies
            }
            ClientMessage::Auth { event } => {
                authed = true;
                vec![RelayMessage::Ok {
                    event_id: event.id,
                    accepted: true,
                    message: String::new(),
                }]
            }
            ClientMessage::Req {
                subscription_id, ..
            } => {
                reqs.fetch_add(1, Ordering::SeqCst);
                let mut replies: Vec<RelayMessage> = behavior
                    .stored_events
                    .iter()
                    .map(|event| RelayMessage::Event {
                        subscription_id: subscription_id.clone(),
                        event: event.clone(),
                    })
                    .collect();
                replies.push(RelayMessage::Eose { subscription_id });
                replies
            }
            ClientMessage::Count {
                subscription_id, ..
            } => {
                vec![RelayMessage::Count {
                    subscription_id,
                    count: behavior.count,
                }]
            }
            ClientMessage::Close { .. } => Vec::new(),
        };
        for reply in replies {
            if ws
                .send(Message::Text(reply.to_json().unwrap().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// A well-formed throwaway event.
pub fn sample_event(content: &str) -> Event {
    let secret = prism_core::parse_secret_key(&prism_core::generate_secret_key()).unwrap();
    prism_core::finalize_event(
        &prism_core::EventTemplate {
            created_at: prism_core::now_timestamp(),
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        },
        &secret,
    )
    .unwrap()
}
