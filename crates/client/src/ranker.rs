//! Exponential success-rate ranking of publish peers.
//!
//! Every publish outcome folds into a peer's rate as
//! `S ← decay·S + (1−decay)·outcome`, so a peer that stops accepting decays
//! toward zero and a recovering peer climbs back. Peers start at a neutral
//! 0.5; peers outside the selection keep their rate untouched.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Default exponential-average decay factor.
pub const DEFAULT_DECAY: f64 = 0.9;

/// Neutral starting rate for a newly-discovered peer.
const INITIAL_RATE: f64 = 0.5;

/// Snapshot of one peer's ranking state.
#[derive(Debug, Clone)]
pub struct PeerScore {
    pub url: String,
    pub success_rate: f64,
    pub last_success_at: Option<Instant>,
    pub mandatory: bool,
}

struct PeerEntry {
    score: PeerScore,
    // tie-break: earlier-known peers win equal rates
    discovered_seq: u64,
}

struct RankerInner {
    peers: HashMap<String, PeerEntry>,
    next_seq: u64,
}

/// Success-rate estimator driving broadcast peer selection.
pub struct PeerRanker {
    inner: RwLock<RankerInner>,
    decay: f64,
}

impl PeerRanker {
    pub fn new(decay: f64) -> Self {
        Self {
            inner: RwLock::new(RankerInner {
                peers: HashMap::new(),
                next_seq: 0,
            }),
            decay,
        }
    }

    /// Register a peer if unknown. Known peers keep their rate; the
    /// mandatory flag is raised but never lowered by re-discovery.
    pub fn add_peer(&self, url: &str, mandatory: bool) {
        let url = url.trim();
        if url.is_empty() {
            return;
        }
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let inner = &mut *guard;
        if !inner.peers.contains_key(url) {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.peers.insert(
                url.to_string(),
                PeerEntry {
                    score: PeerScore {
                        url: url.to_string(),
                        success_rate: INITIAL_RATE,
                        last_success_at: None,
                        mandatory: false,
                    },
                    discovered_seq: seq,
                },
            );
        }
        if mandatory {
            if let Some(entry) = inner.peers.get_mut(url) {
                entry.score.mandatory = true;
            }
        }
    }

    /// Fold a publish outcome into a peer's rate.
    pub fn record_outcome(&self, url: &str, success: bool) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = inner.peers.get_mut(url) {
            let outcome = if success { 1.0 } else { 0.0 };
            entry.score.success_rate =
                self.decay * entry.score.success_rate + (1.0 - self.decay) * outcome;
            if success {
                entry.score.last_success_at = Some(Instant::now());
            }
        }
    }

    /// Peers for one broadcast: every mandatory peer plus the `max_peers`
    /// best-ranked others, ties broken by earliest discovery.
    pub fn select(&self, max_peers: usize) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());

        let mut selected: Vec<String> = inner
            .peers
            .values()
            .filter(|e| e.score.mandatory)
            .map(|e| e.score.url.clone())
            .collect();

        let mut candidates: Vec<&PeerEntry> = inner
            .peers
            .values()
            .filter(|e| !e.score.mandatory)
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .success_rate
                .partial_cmp(&a.score.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.discovered_seq.cmp(&b.discovered_seq))
        });

        selected.extend(
            candidates
                .into_iter()
                .take(max_peers)
                .map(|e| e.score.url.clone()),
        );
        selected
    }

    /// Ranking state by value, for stats.
    pub fn snapshot(&self) -> Vec<PeerScore> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut scores: Vec<PeerScore> = inner.peers.values().map(|e| e.score.clone()).collect();
        scores.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scores
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .peers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rate_of(&self, url: &str) -> Option<f64> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .peers
            .get(url)
            .map(|e| e.score.success_rate)
    }
}
