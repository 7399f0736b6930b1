//! The aggregating store: classification, dispatch, and operation counters.
//!
//! Every client operation funnels through here. Saves go to the broadcast
//! system; queries and counts go to the query pool unless the intent
//! classifier short-circuits them. The store keeps the per-operation
//! counters and timings the stats surface reports, and the save-level
//! consecutive-failure counter that drives publish health.

use crate::classify::{is_deletion_check, DeletionCache, RequestContext};
use prism_client::{BroadcastSystem, ClientError, QueryPool, QueryStream};
use prism_core::{Event, Filter};
use prism_utils::{HealthState, JsonObject, JsonValue, StatsProvider};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Classifier plus dispatch into the upstream subsystems.
pub struct AggregateStore {
    pool: Arc<QueryPool>,
    broadcast: Option<Arc<BroadcastSystem>>,
    deletions: DeletionCache,

    consecutive_publish_failures: AtomicI64,

    query_requests: AtomicI64,
    query_internal: AtomicI64,
    query_external: AtomicI64,
    query_events_returned: AtomicI64,

    count_requests: AtomicI64,
    count_internal: AtomicI64,
    count_external: AtomicI64,
    count_events_returned: AtomicI64,

    total_publish_nanos: AtomicI64,
    publish_ops: AtomicI64,
    total_query_nanos: AtomicI64,
    query_ops: AtomicI64,
    total_count_nanos: AtomicI64,
    count_ops: AtomicI64,
}

impl AggregateStore {
    pub fn new(pool: Arc<QueryPool>, broadcast: Option<Arc<BroadcastSystem>>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            broadcast,
            deletions: DeletionCache::new(),
            consecutive_publish_failures: AtomicI64::new(0),
            query_requests: AtomicI64::new(0),
            query_internal: AtomicI64::new(0),
            query_external: AtomicI64::new(0),
            query_events_returned: AtomicI64::new(0),
            count_requests: AtomicI64::new(0),
            count_internal: AtomicI64::new(0),
            count_external: AtomicI64::new(0),
            count_events_returned: AtomicI64::new(0),
            total_publish_nanos: AtomicI64::new(0),
            publish_ops: AtomicI64::new(0),
            total_query_nanos: AtomicI64::new(0),
            query_ops: AtomicI64::new(0),
            total_count_nanos: AtomicI64::new(0),
            count_ops: AtomicI64::new(0),
        })
    }

    pub fn consecutive_publish_failures(&self) -> i64 {
        self.consecutive_publish_failures.load(Ordering::Relaxed)
    }

    pub fn publish_health(&self) -> HealthState {
        HealthState::from_consecutive_failures(self.consecutive_publish_failures())
    }

    pub fn query_health(&self) -> HealthState {
        HealthState::from_consecutive_failures(self.pool.consecutive_query_failures())
    }

    /// Forward an event to the broadcast system. Succeeds when any peer
    /// accepted; an all-peer failure surfaces the first prefixed error, else
    /// the joined transport errors.
    pub async fn save_event(&self, event: &Event, deadline: Duration) -> Result<(), ClientError> {
        let started = Instant::now();
        let result = match &self.broadcast {
            Some(broadcast) => broadcast.broadcast(event, deadline).await,
            None => {
                debug!(event = %event.id, "no broadcast peers configured, not forwarding");
                Ok(())
            }
        };

        match &result {
            Ok(()) => {
                self.consecutive_publish_failures.store(0, Ordering::Relaxed);
            }
            Err(_) => {
                self.consecutive_publish_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        self.total_publish_nanos
            .fetch_add(started.elapsed().as_nanos() as i64, Ordering::Relaxed);
        self.publish_ops.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Classify then fan a query out. Internal calls, deletion checks
    /// without a subscription id, and queries matching a live deletion
    /// pattern all short-circuit to an immediately-closed stream.
    pub async fn query_events(
        self: &Arc<Self>,
        ctx: &RequestContext,
        filter: Filter,
        deadline: Duration,
    ) -> QueryStream {
        self.query_requests.fetch_add(1, Ordering::Relaxed);

        if ctx.internal {
            self.query_internal.fetch_add(1, Ordering::Relaxed);
            debug!(?filter, "internal query short-circuited");
            return QueryStream::closed();
        }
        if ctx.subscription_id.is_none() {
            if is_deletion_check(&filter) {
                self.query_internal.fetch_add(1, Ordering::Relaxed);
                debug!(?filter, "deletion check short-circuited");
                return QueryStream::closed();
            }
            if DeletionCache::is_deletion_request(&filter) {
                self.deletions.record(&filter);
                self.query_internal.fetch_add(1, Ordering::Relaxed);
                debug!(?filter, "deletion request cached and short-circuited");
                return QueryStream::closed();
            }
            if self.deletions.is_blocked(&filter) {
                self.query_internal.fetch_add(1, Ordering::Relaxed);
                debug!(?filter, "query blocked by cached deletion pattern");
                return QueryStream::closed();
            }
        }

        self.query_external.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut inner = self.pool.query(filter, deadline).await;

        // forward the merged stream so the counters and timing close out
        // exactly when the fan-out does
        let (tx, rx) = mpsc::channel(256);
        let store = Arc::clone(self);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            while let Some(event) = inner.events.recv().await {
                store.query_events_returned.fetch_add(1, Ordering::Relaxed);
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            store
                .total_query_nanos
                .fetch_add(started.elapsed().as_nanos() as i64, Ordering::Relaxed);
            store.query_ops.fetch_add(1, Ordering::Relaxed);
        });

        QueryStream { events: rx, cancel }
    }

    /// Classify then count across the countable subset. Follows the same
    /// short-circuit rules as queries; every failure class yields 0.
    pub async fn count_events(
        &self,
        ctx: &RequestContext,
        filter: Filter,
        deadline: Duration,
    ) -> u64 {
        let started = Instant::now();
        self.count_requests.fetch_add(1, Ordering::Relaxed);

        let short_circuit = ctx.internal
            || (ctx.subscription_id.is_none()
                && (is_deletion_check(&filter)
                    || DeletionCache::is_deletion_request(&filter)
                    || self.deletions.is_blocked(&filter)));
        if short_circuit {
            if !ctx.internal && DeletionCache::is_deletion_request(&filter) {
                self.deletions.record(&filter);
            }
            self.count_internal.fetch_add(1, Ordering::Relaxed);
            debug!(?filter, "count short-circuited");
            return 0;
        }

        self.count_external.fetch_add(1, Ordering::Relaxed);
        let count = self.pool.count(filter, deadline).await;
        if count > 0 {
            self.count_events_returned
                .fetch_add(count as i64, Ordering::Relaxed);
        }

        self.total_count_nanos
            .fetch_add(started.elapsed().as_nanos() as i64, Ordering::Relaxed);
        self.count_ops.fetch_add(1, Ordering::Relaxed);
        count
    }
}

fn average_ms(total_nanos: i64, ops: i64) -> f64 {
    if ops <= 0 {
        0.0
    } else {
        total_nanos as f64 / ops as f64 / 1e6
    }
}

impl StatsProvider for AggregateStore {
    fn name(&self) -> &str {
        "relay_store"
    }

    fn snapshot(&self) -> JsonValue {
        let consecutive_publish = self.consecutive_publish_failures();
        let consecutive_query = self.pool.consecutive_query_failures();
        let publish_state = HealthState::from_consecutive_failures(consecutive_publish);
        let query_state = HealthState::from_consecutive_failures(consecutive_query);
        let main_state = HealthState::worst([publish_state, query_state]);
        let healthy = consecutive_publish < 10 && consecutive_query < 10;

        let (publish_attempts, publish_successes, publish_failures) = match &self.broadcast {
            Some(b) => (b.attempts(), b.successes(), b.failures()),
            None => (0, 0, 0),
        };

        let total_publish_nanos = self.total_publish_nanos.load(Ordering::Relaxed);
        let publish_ops = self.publish_ops.load(Ordering::Relaxed);
        let total_query_nanos = self.total_query_nanos.load(Ordering::Relaxed);
        let query_ops = self.query_ops.load(Ordering::Relaxed);
        let total_count_nanos = self.total_count_nanos.load(Ordering::Relaxed);
        let count_ops = self.count_ops.load(Ordering::Relaxed);

        let mut obj = JsonObject::new();
        obj.set("publish_attempts", publish_attempts)
            .set("publish_successes", publish_successes)
            .set("publish_failures", publish_failures)
            .set("query_requests", self.query_requests.load(Ordering::Relaxed))
            .set(
                "query_internal_requests",
                self.query_internal.load(Ordering::Relaxed),
            )
            .set(
                "query_external_requests",
                self.query_external.load(Ordering::Relaxed),
            )
            .set(
                "query_events_returned",
                self.query_events_returned.load(Ordering::Relaxed),
            )
            .set("query_failures", self.pool.query_failures())
            .set("count_requests", self.count_requests.load(Ordering::Relaxed))
            .set(
                "count_internal_requests",
                self.count_internal.load(Ordering::Relaxed),
            )
            .set(
                "count_external_requests",
                self.count_external.load(Ordering::Relaxed),
            )
            .set(
                "count_events_returned",
                self.count_events_returned.load(Ordering::Relaxed),
            )
            .set("count_failures", self.pool.count_failures())
            .set("consecutive_publish_failures", consecutive_publish)
            .set("consecutive_query_failures", consecutive_query)
            .set("is_healthy", healthy)
            .set(
                "health_status",
                if healthy { "healthy" } else { "unhealthy" },
            )
            .set("publish_health_state", publish_state.as_str())
            .set("query_health_state", query_state.as_str())
            .set("main_health_state", main_state.as_str())
            .set(
                "average_publish_duration_ms",
                average_ms(total_publish_nanos, publish_ops),
            )
            .set(
                "average_query_duration_ms",
                average_ms(total_query_nanos, query_ops),
            )
            .set(
                "average_count_duration_ms",
                average_ms(total_count_nanos, count_ops),
            )
            .set("total_publish_duration_ms", total_publish_nanos / 1_000_000)
            .set("total_query_duration_ms", total_query_nanos / 1_000_000)
            .set("total_count_duration_ms", total_count_nanos / 1_000_000);
        JsonValue::Object(obj)
    }
}
