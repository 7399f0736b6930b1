//! Continuous mirroring of upstream events into the local broadcast sink.
//!
//! On start the mirror opens a since-now subscription on every live query
//! peer and forwards each first-seen event into the sink that feeds
//! connected subscribers. When the upstream subscription drains it
//! re-subscribes with a refreshed since-bound, so a reconnect does not
//! replay history. A 30-second health tick re-acquires every peer and trips
//! the consecutive-failure counter when more than half are dead.

use crate::error::{ClientError, Result};
use crate::session::{SessionRegistry, SubscriptionMessage};
use prism_core::{now_timestamp, Event, Filter};
use prism_utils::{HealthState, JsonObject, JsonValue, StatsProvider};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cadence of the peer health check.
const HEALTH_TICK: Duration = Duration::from_secs(30);

/// Deadline for acquiring a peer during startup and health checks.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(7);

/// Recently-seen event ids kept for cross-peer dedup.
const DEDUP_CAPACITY: usize = 4096;

/// Bounded set of recently-seen ids; eviction is oldest-first.
struct RecentIds {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// True when the id was not seen before.
    fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Long-running subscription consumer feeding the local broadcast sink.
pub struct MirrorManager {
    query_urls: Vec<String>,
    registry: Arc<SessionRegistry>,
    sink: broadcast::Sender<Event>,
    cancel: Mutex<Option<CancellationToken>>,
    mirrored_events: AtomicI64,
    mirror_failures: AtomicI64,
    consecutive_mirror_failures: AtomicI64,
    live_relays: AtomicI64,
    dead_relays: AtomicI64,
}

impl MirrorManager {
    pub fn new(
        query_urls: Vec<String>,
        registry: Arc<SessionRegistry>,
        sink: broadcast::Sender<Event>,
    ) -> Arc<Self> {
        let query_urls = query_urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        Arc::new(Self {
            query_urls,
            registry,
            sink,
            cancel: Mutex::new(None),
            mirrored_events: AtomicI64::new(0),
            mirror_failures: AtomicI64::new(0),
            consecutive_mirror_failures: AtomicI64::new(0),
            live_relays: AtomicI64::new(0),
            dead_relays: AtomicI64::new(0),
        })
    }

    pub fn consecutive_mirror_failures(&self) -> i64 {
        self.consecutive_mirror_failures.load(Ordering::Relaxed)
    }

    /// (live, dead) counts from the most recent health pass.
    pub fn peer_counts(&self) -> (i64, i64) {
        (
            self.live_relays.load(Ordering::Relaxed),
            self.dead_relays.load(Ordering::Relaxed),
        )
    }

    /// Begin mirroring. Idempotent; a no-op without query peers; an error
    /// when every configured peer is dead.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut cancel_slot = self.cancel.lock().await;
        if cancel_slot.is_some() {
            return Ok(());
        }
        if self.query_urls.is_empty() {
            debug!("no query peers configured, skipping mirroring");
            return Ok(());
        }

        let mut live = 0usize;
        for url in &self.query_urls {
            match self.registry.acquire(url, ACQUIRE_TIMEOUT).await {
                Ok(_) => live += 1,
                Err(e) => warn!(url = %url, error = %e, "mirror peer dead at startup"),
            }
        }
        if live == 0 {
            return Err(ClientError::NoPeersAvailable(self.query_urls.len()));
        }

        info!(
            live,
            configured = self.query_urls.len(),
            "starting event mirroring"
        );
        let token = CancellationToken::new();
        *cancel_slot = Some(token.clone());
        drop(cancel_slot);

        let mirror = Arc::clone(self);
        let mirror_token = token.clone();
        tokio::spawn(async move { mirror.mirror_loop(mirror_token).await });

        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.health_loop(token).await });
        Ok(())
    }

    /// Cancel the running subscription. Idempotent.
    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            debug!("stopping event mirroring");
            token.cancel();
        }
    }

    /// Shut the manager down; guarantees the subscription is stopped.
    pub async fn close(&self) {
        self.stop().await;
    }

    async fn mirror_loop(&self, cancel: CancellationToken) {
        let mut recent = RecentIds::new(DEDUP_CAPACITY);
        while !cancel.is_cancelled() {
            let since = now_timestamp();
            let drained = self.run_subscription(&cancel, since, &mut recent).await;
            if cancel.is_cancelled() {
                break;
            }
            if drained {
                // upstream closed on us; re-subscribe from a fresh since so
                // the gap stays small without replaying history
                debug!("mirror subscription drained, re-subscribing");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        debug!("mirror loop stopped");
    }

    /// One aggregated since-`since` subscription across the live peers.
    /// Returns true when every per-peer stream ended.
    async fn run_subscription(
        &self,
        cancel: &CancellationToken,
        since: u64,
        recent: &mut RecentIds,
    ) -> bool {
        let filter = Filter::since(since);
        let (merge_tx, mut merge_rx) = mpsc::channel::<Option<Event>>(256);

        let mut peers = 0usize;
        for url in &self.query_urls {
            let session = match self.registry.acquire(url, ACQUIRE_TIMEOUT).await {
                Ok(session) => session,
                Err(_) => continue,
            };
            peers += 1;
            let sub_id = format!("prism-mirror-{peers}");
            let merge_tx = merge_tx.clone();
            let cancel = cancel.clone();
            let filter = filter.clone();
            tokio::spawn(async move {
                let mut rx = match session.subscribe(&sub_id, filter).await {
                    Ok(rx) => rx,
                    Err(_) => {
                        let _ = merge_tx.send(None).await;
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = rx.recv() => match msg {
                            Some(SubscriptionMessage::Event(event)) => {
                                if merge_tx.send(Some(event)).await.is_err() {
                                    break;
                                }
                            }
                            // live subscription: EOSE just separates stored
                            // from real-time events
                            Some(SubscriptionMessage::Eose) => {}
                            Some(SubscriptionMessage::Closed(_)) | None => {
                                let _ = merge_tx.send(None).await;
                                break;
                            }
                        }
                    }
                }
                session.unsubscribe(&sub_id).await;
            });
        }
        drop(merge_tx);

        if peers == 0 {
            self.mirror_failures.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_secs(1)).await;
            return false;
        }

        let mut ended = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                msg = merge_rx.recv() => match msg {
                    Some(Some(event)) => {
                        if recent.insert(&event.id) {
                            let receivers = self.sink.send(event).unwrap_or(0);
                            self.mirrored_events.fetch_add(1, Ordering::Relaxed);
                            debug!(subscribers = receivers, "mirrored upstream event");
                        }
                    }
                    Some(None) => {
                        ended += 1;
                        if ended >= peers {
                            return true;
                        }
                    }
                    None => return true,
                }
            }
        }
    }

    async fn health_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_TICK);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_peer_health().await,
            }
        }
    }

    /// One pass of the periodic peer probe: re-acquire every query peer and
    /// trip the consecutive counter when more than half are dead.
    pub async fn check_peer_health(&self) {
        if self.query_urls.is_empty() {
            return;
        }
        let mut dead = 0i64;
        for url in &self.query_urls {
            if self.registry.acquire(url, ACQUIRE_TIMEOUT).await.is_err() {
                dead += 1;
                debug!(url = %url, "mirror peer dead");
            }
        }
        let total = self.query_urls.len() as i64;
        self.live_relays.store(total - dead, Ordering::Relaxed);
        self.dead_relays.store(dead, Ordering::Relaxed);

        if dead > total / 2 {
            self.mirror_failures.fetch_add(1, Ordering::Relaxed);
            self.consecutive_mirror_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(dead, total, "mirror health check failed");
        } else {
            self.consecutive_mirror_failures.store(0, Ordering::Relaxed);
            debug!(live = total - dead, total, "mirror health check passed");
        }
    }
}

impl StatsProvider for MirrorManager {
    fn name(&self) -> &str {
        "mirror"
    }

    fn snapshot(&self) -> JsonValue {
        let consecutive = self.consecutive_mirror_failures.load(Ordering::Relaxed);
        let mut obj = JsonObject::new();
        obj.set(
            "mirrored_events",
            self.mirrored_events.load(Ordering::Relaxed),
        )
        .set(
            "mirror_failures",
            self.mirror_failures.load(Ordering::Relaxed),
        )
        .set("consecutive_mirror_failures", consecutive)
        .set(
            "mirror_health_state",
            HealthState::from_consecutive_failures(consecutive).as_str(),
        )
        .set("live_relays", self.live_relays.load(Ordering::Relaxed))
        .set("dead_relays", self.dead_relays.load(Ordering::Relaxed));
        JsonValue::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_ids_dedups() {
        let mut recent = RecentIds::new(8);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
    }

    #[test]
    fn recent_ids_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        recent.insert("a");
        recent.insert("b");
        recent.insert("c");
        // "a" was evicted, so it reads as fresh again
        assert!(recent.insert("a"));
        assert!(!recent.insert("c"));
    }

    #[tokio::test]
    async fn start_without_peers_is_a_no_op() {
        let registry = Arc::new(SessionRegistry::new(None));
        let (sink, _) = broadcast::channel(8);
        let mirror = MirrorManager::new(vec![], registry, sink);
        assert!(mirror.start().await.is_ok());
        assert!(mirror.cancel.lock().await.is_none());
    }

    #[tokio::test]
    async fn start_fails_when_every_peer_is_dead() {
        let registry = Arc::new(SessionRegistry::new(None));
        let (sink, _) = broadcast::channel(8);
        let mirror = MirrorManager::new(
            vec!["ws://127.0.0.1:1".to_string()],
            registry,
            sink,
        );
        let err = mirror.start().await.unwrap_err();
        assert!(matches!(err, ClientError::NoPeersAvailable(1)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = Arc::new(SessionRegistry::new(None));
        let (sink, _) = broadcast::channel(8);
        let mirror = MirrorManager::new(vec![], registry, sink);
        mirror.stop().await;
        mirror.stop().await;
    }
}
