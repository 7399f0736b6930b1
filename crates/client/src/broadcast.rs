//! Ranked broadcast of published events across discovered peers.
//!
//! Each accepted event fans out to the mandatory peers plus the top-N
//! candidates by historical success rate. A bounded job queue feeds a worker
//! pool; each worker runs the per-peer protocol: TTL-cache dedup, session
//! acquire, EVENT send, OK wait, and a single authenticated retry on
//! `auth-required`. Candidate peers come from the seed relays' NIP-65 relay
//! lists, refreshed periodically and on demand.

use crate::error::{parse_error_prefix, ClientError, PrefixedError, Result};
use crate::ranker::PeerRanker;
use crate::session::{SessionRegistry, SubscriptionMessage};
use prism_core::{Event, Filter, KIND_RELAY_LIST};
use prism_utils::{JsonObject, JsonValue, StatsProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the broadcast job queue; enqueue blocks (bounded by the
/// caller's deadline) once full.
const JOB_QUEUE_CAPACITY: usize = 1024;

/// Broadcast system configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Upper bound on non-mandatory peers per broadcast.
    pub max_publish_relays: usize,
    /// Worker pool size.
    pub workers: usize,
    /// Exponential-average decay factor for peer success rates.
    pub success_rate_decay: f64,
    /// Relays asked for relay-list events during discovery.
    pub seed_relays: Vec<String>,
    /// Peers included in every broadcast regardless of rank.
    pub mandatory_relays: Vec<String>,
    /// Dedup window for event-id suppression.
    pub cache_ttl: Duration,
    /// Deadline for seed discovery.
    pub initial_timeout: Duration,
    /// Per-peer publish deadline.
    pub publish_timeout: Duration,
    /// Periodic discovery cadence.
    pub refresh_interval: Duration,
    /// Whose relay-list events discovery looks for.
    pub owner_pubkey: Option<String>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_publish_relays: 50,
            workers: num_cpus::get() * 2,
            success_rate_decay: 0.9,
            seed_relays: Vec::new(),
            mandatory_relays: Vec::new(),
            cache_ttl: Duration::from_secs(300),
            initial_timeout: Duration::from_secs(7),
            publish_timeout: Duration::from_secs(7),
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            owner_pubkey: None,
        }
    }
}

/// Result of one per-peer publish.
#[derive(Debug, Clone)]
enum PeerOutcome {
    Accepted,
    Rejected(PrefixedError),
    Transport(String),
}

struct BroadcastJob {
    event: Event,
    url: String,
    result: oneshot::Sender<PeerOutcome>,
}

/// Worker-pool publisher with ranking, dedup cache, and peer discovery.
pub struct BroadcastSystem {
    config: BroadcastConfig,
    registry: Arc<SessionRegistry>,
    ranker: Arc<PeerRanker>,
    cache: std::sync::RwLock<HashMap<String, Instant>>,
    job_tx: mpsc::Sender<BroadcastJob>,
    job_rx: Arc<Mutex<mpsc::Receiver<BroadcastJob>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    attempts: AtomicI64,
    successes: AtomicI64,
    failures: AtomicI64,
    duplicates_suppressed: AtomicI64,
    consecutive_broadcast_failures: AtomicI64,
}

impl BroadcastSystem {
    pub fn new(config: BroadcastConfig, registry: Arc<SessionRegistry>) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let ranker = Arc::new(PeerRanker::new(config.success_rate_decay));
        for url in &config.mandatory_relays {
            ranker.add_peer(url, true);
        }
        // seed relays double as publish candidates so a broadcast has
        // targets even before discovery finds any relay lists
        for url in &config.seed_relays {
            ranker.add_peer(url, false);
        }
        Arc::new(Self {
            config,
            registry,
            ranker,
            cache: std::sync::RwLock::new(HashMap::new()),
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            attempts: AtomicI64::new(0),
            successes: AtomicI64::new(0),
            failures: AtomicI64::new(0),
            duplicates_suppressed: AtomicI64::new(0),
            consecutive_broadcast_failures: AtomicI64::new(0),
        })
    }

    pub fn ranker(&self) -> &PeerRanker {
        &self.ranker
    }

    pub fn consecutive_broadcast_failures(&self) -> i64 {
        self.consecutive_broadcast_failures.load(Ordering::Relaxed)
    }

    /// Per-peer publish attempts so far.
    pub fn attempts(&self) -> i64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Per-peer publish acceptances so far.
    pub fn successes(&self) -> i64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Per-peer publish failures so far.
    pub fn failures(&self) -> i64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Start workers, the cache sweeper, and periodic discovery. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for worker_id in 0..self.config.workers.max(1) {
            let system = Arc::clone(self);
            tokio::spawn(async move { system.worker_loop(worker_id).await });
        }

        let sweeper = Arc::clone(self);
        tokio::spawn(async move { sweeper.sweep_loop().await });

        self.discover().await;

        let refresher = Arc::clone(self);
        tokio::spawn(async move {
            let period = refresher
                .config
                .refresh_interval
                .max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick; discovery already ran
            loop {
                tokio::select! {
                    _ = refresher.cancel.cancelled() => break,
                    _ = ticker.tick() => refresher.discover().await,
                }
            }
        });

        info!(
            workers = self.config.workers,
            mandatory = self.config.mandatory_relays.len(),
            seeds = self.config.seed_relays.len(),
            "broadcast system started"
        );
    }

    /// Stop workers and background tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Ask every seed peer for the owner's relay-list events and fold the
    /// listed URLs into the candidate pool. Callable on demand.
    pub async fn discover(&self) {
        let mut discovered = 0usize;
        for (index, seed) in self.config.seed_relays.iter().enumerate() {
            let session = match self.registry.acquire(seed, self.config.initial_timeout).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(seed = %seed, error = %e, "seed unavailable for discovery");
                    continue;
                }
            };

            let filter = Filter {
                kinds: Some(vec![KIND_RELAY_LIST]),
                authors: self.config.owner_pubkey.clone().map(|p| vec![p]),
                limit: Some(10),
                ..Default::default()
            };
            let sub_id = format!("prism-discovery-{index}");
            let mut rx = match session.subscribe(&sub_id, filter).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(seed = %seed, error = %e, "discovery subscribe failed");
                    continue;
                }
            };

            let deadline = tokio::time::sleep(self.config.initial_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    msg = rx.recv() => match msg {
                        Some(SubscriptionMessage::Event(event)) => {
                            for url in event.tag_values("r") {
                                if url.starts_with("ws://") || url.starts_with("wss://") {
                                    self.ranker.add_peer(url, false);
                                    discovered += 1;
                                }
                            }
                        }
                        Some(SubscriptionMessage::Eose)
                        | Some(SubscriptionMessage::Closed(_))
                        | None => break,
                    }
                }
            }
            session.unsubscribe(&sub_id).await;
        }
        info!(
            discovered,
            known = self.ranker.len(),
            "relay discovery pass finished"
        );
    }

    /// Broadcast an event to the mandatory set plus the top-ranked
    /// candidates. Succeeds if any peer accepted; an all-peer failure yields
    /// the first prefixed error observed, else the joined transport errors.
    pub async fn broadcast(&self, event: &Event, deadline: Duration) -> Result<()> {
        if self.is_cached(&event.id) {
            self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, "suppressed duplicate broadcast");
            return Ok(());
        }

        let targets = self.ranker.select(self.config.max_publish_relays);
        if targets.is_empty() {
            warn!(event = %event.id, "no broadcast peers known, not forwarding");
            return Ok(());
        }

        let started = Instant::now();
        let mut receivers = Vec::with_capacity(targets.len());
        for url in targets {
            let (tx, rx) = oneshot::channel();
            let job = BroadcastJob {
                event: event.clone(),
                url: url.clone(),
                result: tx,
            };
            let remaining = deadline.saturating_sub(started.elapsed());
            match timeout(remaining, self.job_tx.send(job)).await {
                Ok(Ok(())) => receivers.push((url, rx)),
                _ => {
                    // queue full past the deadline, or workers gone
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    receivers.push((url, {
                        let (tx, rx) = oneshot::channel();
                        let _ = tx.send(PeerOutcome::Transport("broadcast queue full".into()));
                        rx
                    }));
                }
            }
        }

        let mut accepted = 0usize;
        let mut first_rejection: Option<PrefixedError> = None;
        let mut transport_errors = Vec::new();
        for (url, rx) in receivers {
            let remaining = deadline.saturating_sub(started.elapsed());
            match timeout(remaining, rx).await {
                Ok(Ok(PeerOutcome::Accepted)) => accepted += 1,
                Ok(Ok(PeerOutcome::Rejected(e))) => {
                    if first_rejection.is_none() {
                        first_rejection = Some(e.clone());
                    }
                    transport_errors.push(e.to_string());
                }
                Ok(Ok(PeerOutcome::Transport(e))) => {
                    transport_errors.push(format!("{url}: {e}"));
                }
                _ => transport_errors.push(format!("{url}: publish deadline elapsed")),
            }
        }

        if accepted > 0 {
            self.cache_event(&event.id);
            self.consecutive_broadcast_failures
                .store(0, Ordering::Relaxed);
            return Ok(());
        }

        self.consecutive_broadcast_failures
            .fetch_add(1, Ordering::Relaxed);
        if let Some(rejection) = first_rejection {
            return Err(ClientError::Rejected(rejection));
        }
        Err(ClientError::BroadcastFailed(transport_errors.join("; ")))
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "broadcast worker started");
        loop {
            let job = {
                let mut rx = self.job_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                }
            };
            let outcome = self.publish_to_peer(&job.url, &job.event).await;
            let _ = job.result.send(outcome);
        }
        debug!(worker_id, "broadcast worker stopped");
    }

    /// The per-peer protocol: acquire, send, await OK, authenticated retry
    /// on `auth-required`, ranker update.
    async fn publish_to_peer(&self, url: &str, event: &Event) -> PeerOutcome {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let session = match self
            .registry
            .acquire(url, self.config.publish_timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => return self.peer_failed(url, PeerOutcome::Transport(e.to_string())),
        };

        let verdict = match session.publish(event, self.config.publish_timeout).await {
            Ok(verdict) => verdict,
            Err(e) => return self.peer_failed(url, PeerOutcome::Transport(e.to_string())),
        };

        match verdict {
            (true, _) => self.peer_accepted(url),
            (false, message) => {
                let (prefix, detail) = parse_error_prefix(&message);
                if prefix == Some("auth-required") {
                    if let Some(key) = self.registry.secret_key() {
                        debug!(url = %url, "auth-required, authenticating and retrying once");
                        if session.authenticate(key).await.is_ok() {
                            match session.publish(event, self.config.publish_timeout).await {
                                Ok((true, _)) => return self.peer_accepted(url),
                                Ok((false, retry_message)) => {
                                    let (retry_prefix, retry_detail) =
                                        parse_error_prefix(&retry_message);
                                    return self.peer_failed(
                                        url,
                                        rejection_outcome(url, retry_prefix, retry_detail),
                                    );
                                }
                                Err(e) => {
                                    return self
                                        .peer_failed(url, PeerOutcome::Transport(e.to_string()))
                                }
                            }
                        }
                    }
                }
                self.peer_failed(url, rejection_outcome(url, prefix, detail))
            }
        }
    }

    fn peer_accepted(&self, url: &str) -> PeerOutcome {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.ranker.record_outcome(url, true);
        PeerOutcome::Accepted
    }

    fn peer_failed(&self, url: &str, outcome: PeerOutcome) -> PeerOutcome {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.ranker.record_outcome(url, false);
        if let PeerOutcome::Transport(ref e) = outcome {
            debug!(url = %url, error = %e, "publish failed");
        }
        outcome
    }

    fn is_cached(&self, event_id: &str) -> bool {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        cache
            .get(event_id)
            .map(|at| at.elapsed() < self.config.cache_ttl)
            .unwrap_or(false)
    }

    fn cache_event(&self, event_id: &str) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        cache.insert(event_id.to_string(), Instant::now());
    }

    fn cache_size(&self) -> usize {
        self.cache.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn sweep_loop(&self) {
        let period = self.config.cache_ttl.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ttl = self.config.cache_ttl;
                    let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
                    cache.retain(|_, at| at.elapsed() < ttl);
                    debug!(size = cache.len(), "swept broadcast cache");
                }
            }
        }
    }
}

fn rejection_outcome(url: &str, prefix: Option<&'static str>, detail: String) -> PeerOutcome {
    match prefix {
        Some(prefix) => PeerOutcome::Rejected(PrefixedError {
            prefix: prefix.to_string(),
            message: detail,
            relay_url: url.to_string(),
        }),
        None => PeerOutcome::Transport(detail),
    }
}

impl StatsProvider for BroadcastSystem {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn snapshot(&self) -> JsonValue {
        let mut obj = JsonObject::new();
        obj.set("attempts", self.attempts.load(Ordering::Relaxed))
            .set("successes", self.successes.load(Ordering::Relaxed))
            .set("failures", self.failures.load(Ordering::Relaxed))
            .set(
                "duplicates_suppressed",
                self.duplicates_suppressed.load(Ordering::Relaxed),
            )
            .set(
                "consecutive_broadcast_failures",
                self.consecutive_broadcast_failures.load(Ordering::Relaxed),
            )
            .set("cache_size", self.cache_size())
            .set("known_peers", self.ranker.len())
            .set("workers", self.config.workers);
        JsonValue::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_with(config: BroadcastConfig) -> Arc<BroadcastSystem> {
        let registry = Arc::new(SessionRegistry::new(None));
        BroadcastSystem::new(config, registry)
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let system = system_with(BroadcastConfig {
            cache_ttl: Duration::from_millis(30),
            ..Default::default()
        });
        system.cache_event("abc");
        assert!(system.is_cached("abc"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!system.is_cached("abc"));
    }

    #[tokio::test]
    async fn cached_event_is_suppressed() {
        let system = system_with(BroadcastConfig {
            mandatory_relays: vec!["ws://127.0.0.1:1".to_string()],
            ..Default::default()
        });
        system.cache_event("eee");
        let event = prism_core::Event {
            id: "eee".to_string(),
            pubkey: String::new(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let result = system.broadcast(&event, Duration::from_millis(100)).await;
        assert!(result.is_ok());
        assert_eq!(system.duplicates_suppressed.load(Ordering::Relaxed), 1);
        assert_eq!(system.attempts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn no_known_peers_is_a_no_op() {
        let system = system_with(BroadcastConfig::default());
        let event = prism_core::Event {
            id: "x".to_string(),
            pubkey: String::new(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert!(system.broadcast(&event, Duration::from_millis(100)).await.is_ok());
        assert!(!system.is_cached("x"));
    }

    #[test]
    fn mandatory_and_seed_relays_enter_the_pool() {
        let system = system_with(BroadcastConfig {
            mandatory_relays: vec!["wss://must".to_string()],
            seed_relays: vec!["wss://seed".to_string()],
            ..Default::default()
        });
        assert_eq!(system.ranker.len(), 2);
        let snapshot = system.ranker.snapshot();
        let must = snapshot.iter().find(|p| p.url == "wss://must").unwrap();
        assert!(must.mandatory);
        let seed = snapshot.iter().find(|p| p.url == "wss://seed").unwrap();
        assert!(!seed.mandatory);
    }

    #[test]
    fn rejection_outcome_requires_known_prefix() {
        match rejection_outcome("wss://r", Some("blocked"), "spam".to_string()) {
            PeerOutcome::Rejected(e) => {
                assert_eq!(e.prefix, "blocked");
                assert_eq!(e.relay_url, "wss://r");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        match rejection_outcome("wss://r", None, "weird failure".to_string()) {
            PeerOutcome::Transport(msg) => assert_eq!(msg, "weird failure"),
            other => panic!("expected transport, got {other:?}"),
        }
    }
}
