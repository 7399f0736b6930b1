//! Upstream relay sessions and the session registry.
//!
//! A [`RelaySession`] owns one WebSocket connection to an upstream relay: a
//! writer half guarded by a mutex and a reader task that routes incoming
//! relay messages to whoever is waiting on them (per-subscription channels,
//! pending OK/COUNT oneshots, the NIP-42 challenge slot).
//!
//! The [`SessionRegistry`] keys live sessions by URL and re-dials lazily:
//! a read-locked lookup serves the common case, and a write-locked dial
//! replaces dead entries. Authentication failures are logged but never fail
//! an acquire.

use crate::error::{ClientError, Result};
use bitcoin::secp256k1::SecretKey;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prism_core::{
    finalize_event, now_timestamp, ClientMessage, Event, EventTemplate, Filter, RelayMessage,
    KIND_CLIENT_AUTH,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long an on-demand authentication waits for the relay's challenge.
const AUTH_CHALLENGE_WAIT: Duration = Duration::from_secs(2);

/// Connection lifecycle of an upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

/// Message delivered to a subscription's receiver.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    Event(Event),
    Eose,
    Closed(String),
}

#[derive(Default, Debug)]
struct Routes {
    subscriptions: HashMap<String, mpsc::UnboundedSender<SubscriptionMessage>>,
    pending_oks: HashMap<String, oneshot::Sender<(bool, String)>>,
    pending_counts: HashMap<String, oneshot::Sender<u64>>,
}

/// One live connection to an upstream relay.
#[derive(Debug)]
pub struct RelaySession {
    url: Url,
    state: RwLock<SessionState>,
    alive: AtomicBool,
    writer: Mutex<WsSink>,
    routes: Arc<Mutex<Routes>>,
    auth_challenge: Arc<std::sync::RwLock<Option<String>>>,
    last_error: std::sync::RwLock<Option<String>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelaySession {
    /// Dial a relay and start its reader task.
    pub async fn connect(url: &str, deadline: Duration) -> Result<Arc<Self>> {
        let url = Url::parse(url.trim()).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        debug!(url = %url, "connecting");
        let ws = match timeout(deadline, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Err(ClientError::WebSocket(e.to_string())),
            Err(_) => {
                return Err(ClientError::Timeout(format!(
                    "connect to {url} timed out after {deadline:?}"
                )))
            }
        };

        let (sink, source) = ws.split();
        let session = Arc::new(Self {
            url,
            state: RwLock::new(SessionState::Connected),
            alive: AtomicBool::new(true),
            writer: Mutex::new(sink),
            routes: Arc::new(Mutex::new(Routes::default())),
            auth_challenge: Arc::new(std::sync::RwLock::new(None)),
            last_error: std::sync::RwLock::new(None),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::read_loop(Arc::clone(&session), source));
        *session.reader.lock().await = Some(handle);

        debug!(url = %session.url, "connected");
        Ok(session)
    }

    async fn read_loop(session: Arc<Self>, mut source: WsSource) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                    Ok(msg) => session.route(msg).await,
                    Err(e) => {
                        debug!(url = %session.url, error = %e, "unparseable relay message")
                    }
                },
                Ok(Message::Ping(data)) => {
                    let mut writer = session.writer.lock().await;
                    let _ = writer.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    *session.last_error.write().unwrap_or_else(|p| p.into_inner()) =
                        Some(e.to_string());
                    break;
                }
            }
        }
        session.mark_dead().await;
    }

    async fn route(&self, msg: RelayMessage) {
        let mut routes = self.routes.lock().await;
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if let Some(tx) = routes.subscriptions.get(&subscription_id) {
                    let _ = tx.send(SubscriptionMessage::Event(event));
                }
            }
            RelayMessage::Eose { subscription_id } => {
                if let Some(tx) = routes.subscriptions.get(&subscription_id) {
                    let _ = tx.send(SubscriptionMessage::Eose);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if let Some(tx) = routes.subscriptions.remove(&subscription_id) {
                    let _ = tx.send(SubscriptionMessage::Closed(message));
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if let Some(tx) = routes.pending_oks.remove(&event_id) {
                    let _ = tx.send((accepted, message));
                }
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                if let Some(tx) = routes.pending_counts.remove(&subscription_id) {
                    let _ = tx.send(count);
                }
            }
            RelayMessage::Auth { challenge } => {
                debug!(url = %self.url, "received auth challenge");
                *self
                    .auth_challenge
                    .write()
                    .unwrap_or_else(|p| p.into_inner()) = Some(challenge);
            }
            RelayMessage::Notice { message } => {
                debug!(url = %self.url, notice = %message, "relay notice");
            }
        }
    }

    async fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        *self.state.write().await = SessionState::Disconnected;
        // dropping the senders ends every subscription stream
        let mut routes = self.routes.lock().await;
        routes.subscriptions.clear();
        routes.pending_oks.clear();
        routes.pending_counts.clear();
    }

    /// Non-blocking liveness check.
    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Most recent transport error, if the session has seen one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn send(&self, msg: &ClientMessage) -> Result<()> {
        if !self.is_live() {
            return Err(ClientError::NotConnected);
        }
        let text = msg
            .to_json()
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    /// Publish an event and await the relay's OK verdict.
    pub async fn publish(&self, event: &Event, deadline: Duration) -> Result<(bool, String)> {
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes.lock().await;
            routes.pending_oks.insert(event.id.clone(), tx);
        }
        if let Err(e) = self
            .send(&ClientMessage::Event {
                event: event.clone(),
            })
            .await
        {
            self.routes.lock().await.pending_oks.remove(&event.id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.routes.lock().await.pending_oks.remove(&event.id);
                Err(ClientError::Timeout(format!(
                    "no OK from {} within {deadline:?}",
                    self.url
                )))
            }
        }
    }

    /// Open a subscription; messages arrive on the returned receiver until
    /// EOSE/CLOSED handling upstream or [`Self::unsubscribe`].
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Filter,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock().await;
            routes
                .subscriptions
                .insert(subscription_id.to_string(), tx);
        }
        if let Err(e) = self
            .send(&ClientMessage::Req {
                subscription_id: subscription_id.to_string(),
                filters: vec![filter],
            })
            .await
        {
            self.routes
                .lock()
                .await
                .subscriptions
                .remove(subscription_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Close a subscription; best-effort on the wire.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        self.routes
            .lock()
            .await
            .subscriptions
            .remove(subscription_id);
        let _ = self
            .send(&ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            })
            .await;
    }

    /// Issue a NIP-45 COUNT and await the total.
    pub async fn count(
        &self,
        subscription_id: &str,
        filter: Filter,
        deadline: Duration,
    ) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes.lock().await;
            routes
                .pending_counts
                .insert(subscription_id.to_string(), tx);
        }
        if let Err(e) = self
            .send(&ClientMessage::Count {
                subscription_id: subscription_id.to_string(),
                filters: vec![filter],
            })
            .await
        {
            self.routes
                .lock()
                .await
                .pending_counts
                .remove(subscription_id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.routes
                    .lock()
                    .await
                    .pending_counts
                    .remove(subscription_id);
                Err(ClientError::Timeout(format!(
                    "no COUNT from {} within {deadline:?}",
                    self.url
                )))
            }
        }
    }

    /// Whether the relay has issued a NIP-42 challenge on this session.
    pub fn has_challenge(&self) -> bool {
        self.auth_challenge
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Perform a NIP-42 challenge-response with the given key. Waits a short
    /// bounded time for a challenge when none has arrived yet.
    pub async fn authenticate(&self, secret_key: &SecretKey) -> Result<()> {
        let deadline = tokio::time::Instant::now() + AUTH_CHALLENGE_WAIT;
        let challenge = loop {
            if let Some(challenge) = self
                .auth_challenge
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
            {
                break challenge;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout(format!(
                    "no auth challenge from {}",
                    self.url
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        let template = EventTemplate {
            created_at: now_timestamp(),
            kind: KIND_CLIENT_AUTH,
            tags: vec![
                vec!["relay".to_string(), self.url.to_string()],
                vec!["challenge".to_string(), challenge],
            ],
            content: String::new(),
        };
        let auth_event = finalize_event(&template, secret_key)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes.lock().await;
            routes.pending_oks.insert(auth_event.id.clone(), tx);
        }
        self.send(&ClientMessage::Auth { event: auth_event }).await?;

        match timeout(AUTH_CHALLENGE_WAIT, rx).await {
            Ok(Ok((true, _))) => {
                *self.state.write().await = SessionState::Authenticated;
                debug!(url = %self.url, "authenticated");
                Ok(())
            }
            Ok(Ok((false, message))) => Err(ClientError::WebSocket(format!(
                "auth rejected by {}: {message}",
                self.url
            ))),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout(format!(
                "auth OK from {} timed out",
                self.url
            ))),
        }
    }

    /// Tear the session down.
    pub async fn close(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        drop(writer);
        self.mark_dead().await;
    }
}

/// Lazily-dialing cache of upstream sessions, keyed by URL.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<RelaySession>>>,
    secret_key: Option<SecretKey>,
}

impl SessionRegistry {
    pub fn new(secret_key: Option<SecretKey>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            secret_key,
        }
    }

    /// The upstream-auth key, when one is configured.
    pub fn secret_key(&self) -> Option<&SecretKey> {
        self.secret_key.as_ref()
    }

    /// Return a live session for the URL, dialing if the cached one is
    /// missing or dead. Bounded by `deadline`; a connect error returns
    /// immediately and retrying is the caller's concern.
    ///
    /// The map lock is held only around lookups and the insert; dialing
    /// happens outside it so one slow peer cannot stall every acquire.
    pub async fn acquire(&self, url: &str, deadline: Duration) -> Result<Arc<RelaySession>> {
        let url = url.trim();
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(url) {
                if session.is_live() {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let session = RelaySession::connect(url, deadline).await?;

        // Challenge-response when the relay demanded auth at connect time.
        // Failure is logged, never fatal: plenty of relays work unauthenticated.
        if let Some(key) = &self.secret_key {
            if session.has_challenge() {
                if let Err(e) = session.authenticate(key).await {
                    warn!(url, error = %e, "authentication failed");
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        // another caller may have dialed the same peer while we did; keep
        // the existing live session and drop ours
        if let Some(existing) = sessions.get(url) {
            if existing.is_live() {
                let existing = Arc::clone(existing);
                drop(sessions);
                session.close().await;
                return Ok(existing);
            }
        }
        sessions.insert(url.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Number of cached sessions (live or not).
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of cached sessions currently live.
    pub async fn live_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_live())
            .count()
    }

    /// Release every session. Idempotent.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.close().await;
        }
    }
}
