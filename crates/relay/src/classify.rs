//! Request-intent classification ahead of any fan-out.
//!
//! The relay framework generates bookkeeping queries of its own (deletion
//! checks before accepting an event, deletion-request lookups) that must
//! not leak upstream and inflate the fan-out. Two rules short-circuit them:
//! an explicit internal marker on the request context, and the literal
//! deletion-check filter shape when no subscription id is present.
//!
//! Deletion *requests* carrying `##`-prefixed tag patterns are additionally
//! cached for a short window; follow-up queries matching a cached pattern
//! are answered empty while the entry lives.

use prism_core::{Filter, KIND_DELETION};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a deletion-request pattern suppresses matching queries.
const DELETION_CACHE_DELAY: Duration = Duration::from_secs(3);

/// Per-request context threaded from the server into every store call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Marked by the framework for internally-generated calls.
    pub internal: bool,
    /// Subscription identity for real client subscriptions; internal
    /// bookkeeping calls carry none.
    pub subscription_id: Option<String>,
}

impl RequestContext {
    /// Context for a client subscription.
    pub fn subscription(id: impl Into<String>) -> Self {
        Self {
            internal: false,
            subscription_id: Some(id.into()),
        }
    }

    /// Context for an internally-generated call.
    pub fn internal() -> Self {
        Self {
            internal: true,
            subscription_id: None,
        }
    }
}

/// The literal deletion-check shape: exactly one kind equal to 5, exactly
/// one `#e` value, and nothing else constrained.
pub fn is_deletion_check(filter: &Filter) -> bool {
    if !matches!(filter.kinds.as_deref(), Some([KIND_DELETION])) {
        return false;
    }
    if filter.tags.len() != 1 {
        return false;
    }
    let Some(values) = filter.tags.get("#e") else {
        return false;
    };
    values.len() == 1
        && filter.authors.as_deref().map_or(true, |a| a.is_empty())
        && filter.ids.as_deref().map_or(true, |i| i.is_empty())
        && filter.since.is_none()
        && filter.until.is_none()
}

struct DeletionEntry {
    at: Instant,
    /// `(kind, author)` pairs extracted from `##`-prefixed tag patterns.
    blocked: HashSet<(u16, String)>,
}

/// Short-lived cache of deletion-request patterns.
#[derive(Default)]
pub struct DeletionCache {
    entries: Mutex<HashMap<String, DeletionEntry>>,
}

impl DeletionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this filter is a deletion request that belongs in the cache:
    /// kind 5 with at least one `##`-prefixed tag pattern.
    pub fn is_deletion_request(filter: &Filter) -> bool {
        matches!(filter.kinds.as_deref(), Some([KIND_DELETION]))
            && filter.tags.keys().any(|k| k.starts_with("##"))
    }

    /// Record a deletion request. Returns true when the filter was already
    /// cached (the caller should answer empty without re-recording).
    pub fn record(&self, filter: &Filter) -> bool {
        let key = cache_key(filter);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, e| e.at.elapsed() < DELETION_CACHE_DELAY);
        if entries.contains_key(&key) {
            debug!(key = %key, "deletion request already cached");
            return true;
        }
        let blocked = blocked_pairs(filter);
        debug!(key = %key, patterns = blocked.len(), "caching deletion request");
        entries.insert(
            key,
            DeletionEntry {
                at: Instant::now(),
                blocked,
            },
        );
        false
    }

    /// Whether a follow-up query matches a live cached deletion pattern:
    /// exactly one kind and one author equal to a blocked pair.
    pub fn is_blocked(&self, filter: &Filter) -> bool {
        let (Some([kind]), Some([author])) =
            (filter.kinds.as_deref(), filter.authors.as_deref())
        else {
            return false;
        };
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.values().any(|e| {
            e.at.elapsed() < DELETION_CACHE_DELAY
                && e.blocked.contains(&(*kind, author.clone()))
        })
    }
}

fn cache_key(filter: &Filter) -> String {
    let mut key = String::from("kind5");
    if let Some(since) = filter.since {
        key.push_str(&format!(":since:{since}"));
    }
    if let Some(until) = filter.until {
        key.push_str(&format!(":until:{until}"));
    }
    if let Some(authors) = &filter.authors {
        key.push_str(&format!(":authors:{}", authors.join(",")));
    }
    if let Some(ids) = &filter.ids {
        key.push_str(&format!(":ids:{}", ids.join(",")));
    }
    for (tag, values) in &filter.tags {
        key.push_str(&format!(":{tag}:{}", values.join(",")));
    }
    key
}

/// Extract `(kind, author)` pairs from `##`-tag values shaped
/// `"<kind>:<author>:..."`.
fn blocked_pairs(filter: &Filter) -> HashSet<(u16, String)> {
    let mut blocked = HashSet::new();
    for (tag, values) in &filter.tags {
        if !tag.starts_with("##") {
            continue;
        }
        for value in values {
            let mut parts = value.splitn(3, ':');
            let (Some(kind), Some(author)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let Ok(kind) = kind.parse::<u16>() {
                if !author.is_empty() {
                    blocked.insert((kind, author.to_string()));
                }
            }
        }
    }
    blocked
}
