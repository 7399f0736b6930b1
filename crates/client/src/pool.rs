//! Query fan-out and fan-in across the configured query peers.
//!
//! A query acquires a fan-out slot (bounded by [`MAX_CONCURRENT_FANOUTS`]),
//! subscribes on every live query peer, and merges the per-peer streams into
//! one deduplicated event channel that closes once every participating peer
//! has signalled EOSE or the deadline elapses. Peer failures are isolated:
//! a dead peer is excluded from the fan-out and counted, never surfaced.
//!
//! COUNT requests go only to the countable subset established by the NIP-11
//! probe and return the sum of per-peer counts; every failure class yields 0.

use crate::session::{RelaySession, SessionRegistry, SubscriptionMessage};
use prism_core::{Event, Filter};
use prism_utils::{JsonObject, JsonValue, StatsProvider};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ceiling on concurrently-active query fan-outs.
pub const MAX_CONCURRENT_FANOUTS: usize = 20;

/// Deadline for acquiring a session inside a fan-out.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(7);

/// Capacity of the merged per-subscription event channel.
const MERGE_BUFFER: usize = 256;

/// A live aggregated subscription: the merged event stream plus its
/// cancellation handle. Dropping or cancelling the token tears down every
/// per-peer reader.
pub struct QueryStream {
    pub events: mpsc::Receiver<Event>,
    pub cancel: CancellationToken,
}

impl QueryStream {
    /// A stream that is already closed, used for short-circuited requests.
    pub fn closed() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        QueryStream {
            events: rx,
            cancel: CancellationToken::new(),
        }
    }
}

enum PeerMessage {
    Event(Event),
    Eose,
}

/// Fan-out/fan-in aggregator over the configured query peers.
pub struct QueryPool {
    registry: Arc<SessionRegistry>,
    query_urls: Vec<String>,
    countable_urls: std::sync::RwLock<Vec<String>>,
    fanouts: Arc<Semaphore>,
    fanout_waiting: Arc<AtomicI64>,
    sub_seq: AtomicU64,
    query_failures: AtomicI64,
    count_failures: AtomicI64,
    consecutive_query_failures: AtomicI64,
}

impl QueryPool {
    pub fn new(registry: Arc<SessionRegistry>, query_urls: Vec<String>) -> Self {
        let query_urls = query_urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        Self {
            registry,
            query_urls,
            countable_urls: std::sync::RwLock::new(Vec::new()),
            fanouts: Arc::new(Semaphore::new(MAX_CONCURRENT_FANOUTS)),
            fanout_waiting: Arc::new(AtomicI64::new(0)),
            sub_seq: AtomicU64::new(0),
            query_failures: AtomicI64::new(0),
            count_failures: AtomicI64::new(0),
            consecutive_query_failures: AtomicI64::new(0),
        }
    }

    pub fn query_urls(&self) -> &[String] {
        &self.query_urls
    }

    /// Install the COUNT-capable subset discovered by the capability probe.
    pub fn set_countable(&self, urls: Vec<String>) {
        *self
            .countable_urls
            .write()
            .unwrap_or_else(|p| p.into_inner()) = urls;
    }

    pub fn countable_urls(&self) -> Vec<String> {
        self.countable_urls
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn consecutive_query_failures(&self) -> i64 {
        self.consecutive_query_failures.load(Ordering::Relaxed)
    }

    /// Peer-acquire failures observed during query fan-outs.
    pub fn query_failures(&self) -> i64 {
        self.query_failures.load(Ordering::Relaxed)
    }

    /// Peer failures observed during COUNT dispatches.
    pub fn count_failures(&self) -> i64 {
        self.count_failures.load(Ordering::Relaxed)
    }

    fn next_subscription_id(&self) -> String {
        format!("prism-{}", self.sub_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquire every query peer, returning the live subset. Each failure
    /// increments the query-failure counter; the consecutive counter
    /// increments when any peer failed and resets when none did.
    async fn ensure_peers(&self, urls: &[String]) -> Vec<(String, Arc<RelaySession>)> {
        let mut live = Vec::new();
        let mut failures = 0;
        for url in urls {
            match self.registry.acquire(url, ACQUIRE_TIMEOUT).await {
                Ok(session) => live.push((url.clone(), session)),
                Err(e) => {
                    failures += 1;
                    self.query_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %url, error = %e, "failed to ensure query peer");
                }
            }
        }
        if failures == 0 {
            self.consecutive_query_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_query_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        live
    }

    /// Fan a filter out to every live query peer and merge the replies into
    /// one at-most-once-per-id stream. The stream closes when every
    /// participating peer has EOSE'd or the deadline elapses; cancelling the
    /// returned token closes it early.
    pub async fn query(&self, filter: Filter, deadline: Duration) -> QueryStream {
        self.fanout_waiting.fetch_add(1, Ordering::Relaxed);
        let permit = timeout(deadline, Arc::clone(&self.fanouts).acquire_owned()).await;
        self.fanout_waiting.fetch_sub(1, Ordering::Relaxed);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            // semaphore never closes; this is the deadline elapsing
            _ => {
                self.query_failures.fetch_add(1, Ordering::Relaxed);
                debug!("fan-out slot not available within deadline");
                return QueryStream::closed();
            }
        };

        let peers = self.ensure_peers(&self.query_urls).await;
        if peers.is_empty() {
            return QueryStream::closed();
        }

        let cancel = CancellationToken::new();
        let (merge_tx, mut merge_rx) = mpsc::channel::<PeerMessage>(MERGE_BUFFER);
        let (out_tx, out_rx) = mpsc::channel::<Event>(MERGE_BUFFER);
        let peer_count = peers.len();

        for (url, session) in peers {
            let sub_id = self.next_subscription_id();
            let merge_tx = merge_tx.clone();
            let cancel = cancel.clone();
            let filter = filter.clone();
            tokio::spawn(async move {
                let mut rx = match session.subscribe(&sub_id, filter).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        debug!(url = %url, error = %e, "peer subscribe failed");
                        let _ = merge_tx.send(PeerMessage::Eose).await;
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = rx.recv() => match msg {
                            Some(SubscriptionMessage::Event(event)) => {
                                if merge_tx.send(PeerMessage::Event(event)).await.is_err() {
                                    break;
                                }
                            }
                            Some(SubscriptionMessage::Eose)
                            | Some(SubscriptionMessage::Closed(_))
                            | None => {
                                let _ = merge_tx.send(PeerMessage::Eose).await;
                                break;
                            }
                        }
                    }
                }
                session.unsubscribe(&sub_id).await;
            });
        }
        drop(merge_tx);

        let merge_cancel = cancel.clone();
        tokio::spawn(async move {
            // permit held for the lifetime of the fan-out
            let _permit = permit;
            let mut seen: HashSet<String> = HashSet::new();
            let mut eose_count = 0usize;
            let deadline = tokio::time::sleep(deadline);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = merge_cancel.cancelled() => break,
                    _ = &mut deadline => break,
                    msg = merge_rx.recv() => match msg {
                        Some(PeerMessage::Event(event)) => {
                            if seen.insert(event.id.clone())
                                && out_tx.send(event).await.is_err()
                            {
                                break;
                            }
                        }
                        Some(PeerMessage::Eose) => {
                            eose_count += 1;
                            if eose_count >= peer_count {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            merge_cancel.cancel();
        });

        QueryStream { events: out_rx, cancel }
    }

    /// NIP-45 count across the countable subset: the sum of per-peer counts,
    /// with no cross-peer dedup (upstream counts are probabilistic). Returns
    /// 0 when no peer is countable or every countable peer fails.
    pub async fn count(&self, filter: Filter, deadline: Duration) -> u64 {
        let countable = self.countable_urls();
        if countable.is_empty() {
            debug!("no COUNT-capable query peers; returning 0");
            return 0;
        }

        let mut failures = 0;
        let mut total = 0u64;
        for url in &countable {
            let session = match self.registry.acquire(url, ACQUIRE_TIMEOUT).await {
                Ok(session) => session,
                Err(e) => {
                    failures += 1;
                    self.count_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %url, error = %e, "failed to ensure countable peer");
                    continue;
                }
            };
            let sub_id = self.next_subscription_id();
            match session.count(&sub_id, filter.clone(), deadline).await {
                Ok(count) => total += count,
                Err(e) => {
                    failures += 1;
                    self.count_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %url, error = %e, "peer count failed");
                }
            }
        }

        if failures == 0 {
            self.consecutive_query_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_query_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        total
    }
}

impl StatsProvider for QueryPool {
    fn name(&self) -> &str {
        "query_pool"
    }

    fn snapshot(&self) -> JsonValue {
        let mut obj = JsonObject::new();
        obj.set("query_peers", self.query_urls.len())
            .set("countable_peers", self.countable_urls().len())
            .set("fanout_capacity", MAX_CONCURRENT_FANOUTS)
            .set("fanout_available", self.fanouts.available_permits())
            .set(
                "fanout_waiting",
                self.fanout_waiting.load(Ordering::Relaxed),
            )
            .set("query_failures", self.query_failures.load(Ordering::Relaxed))
            .set("count_failures", self.count_failures.load(Ordering::Relaxed))
            .set(
                "consecutive_query_failures",
                self.consecutive_query_failures.load(Ordering::Relaxed),
            );
        JsonValue::Object(obj)
    }
}
