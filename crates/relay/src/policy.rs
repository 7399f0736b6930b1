//! Connection, filter, and event-validity policy.
//!
//! Two keyed rate limiters gate the client side: new connections per source
//! IP (one per five-minute window, burst 100) and filters per source IP
//! (twenty per minute, burst 100). Event caps reject oversized or malformed
//! events with a `blocked:` prefix before any upstream fan-out sees them.

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use prism_core::{now_timestamp, Event};
use std::net::IpAddr;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Maximum accepted content size in bytes.
pub const MAX_CONTENT_BYTES: usize = 32_768;

/// Maximum accepted tag count.
pub const MAX_TAGS: usize = 100;

/// Maximum accepted kind.
pub const MAX_KIND: u16 = 30_000;

/// Accepted clock skew into the future, in seconds.
pub const MAX_FUTURE_SECONDS: u64 = 3_600;

/// Accepted age into the past, in seconds.
pub const MAX_PAST_SECONDS: u64 = 31_536_000;

/// Tag count above which empty content reads as spam.
pub const MAX_TAGS_WITH_EMPTY_CONTENT: usize = 20;

/// Rate limiter shape, exposed for tests.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Connections allowed per IP per period.
    pub connections_per_hour: u32,
    /// Filters allowed per IP per minute.
    pub filters_per_minute: u32,
    /// Shared burst allowance.
    pub burst: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            // 12 per hour is one per five-minute window
            connections_per_hour: 12,
            filters_per_minute: 20,
            burst: 100,
        }
    }
}

/// IP-keyed rate limits plus event-validity caps.
pub struct Policy {
    connection_limiter: KeyedLimiter,
    filter_limiter: KeyedLimiter,
}

impl Policy {
    pub fn new(config: PolicyConfig) -> Self {
        let connections = Quota::per_hour(
            std::num::NonZeroU32::new(config.connections_per_hour).unwrap_or(nonzero!(12u32)),
        )
        .allow_burst(std::num::NonZeroU32::new(config.burst).unwrap_or(nonzero!(100u32)));
        let filters = Quota::per_minute(
            std::num::NonZeroU32::new(config.filters_per_minute).unwrap_or(nonzero!(20u32)),
        )
        .allow_burst(std::num::NonZeroU32::new(config.burst).unwrap_or(nonzero!(100u32)));

        Self {
            connection_limiter: RateLimiter::keyed(connections),
            filter_limiter: RateLimiter::keyed(filters),
        }
    }

    /// Whether a new connection from this IP is allowed.
    pub fn check_connection(&self, ip: IpAddr) -> bool {
        self.connection_limiter.check_key(&ip).is_ok()
    }

    /// Whether another filter from this IP is allowed.
    pub fn check_filter(&self, ip: IpAddr) -> bool {
        self.filter_limiter.check_key(&ip).is_ok()
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// Validity caps applied before publish fan-out. Returns the full
/// `blocked:`-prefixed rejection message.
pub fn validate_event_caps(event: &Event) -> Result<(), String> {
    if event.content.len() > MAX_CONTENT_BYTES {
        return Err("blocked: event content too large".to_string());
    }
    if event.tags.len() > MAX_TAGS {
        return Err("blocked: too many tags".to_string());
    }
    let now = now_timestamp();
    if event.created_at > now + MAX_FUTURE_SECONDS {
        return Err("blocked: event timestamp too far in future".to_string());
    }
    if event.created_at < now.saturating_sub(MAX_PAST_SECONDS) {
        return Err("blocked: event timestamp too far in past".to_string());
    }
    if event.kind > MAX_KIND {
        return Err("blocked: invalid event kind".to_string());
    }
    if event.content.trim().is_empty() && event.tags.len() > MAX_TAGS_WITH_EMPTY_CONTENT {
        return Err("blocked: empty content with excessive tags".to_string());
    }
    Ok(())
}
