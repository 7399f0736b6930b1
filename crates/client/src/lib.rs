//! Upstream relay machinery for the Prism aggregator.
//!
//! This crate owns everything that faces upstream relays:
//!
//! - [`session`]: lazily-dialed, cached, optionally authenticated WebSocket
//!   sessions, keyed by URL
//! - [`pool`]: query fan-out/fan-in with per-peer failure isolation, a
//!   concurrency ceiling, and NIP-45 counting over the countable subset
//! - [`ranker`] + [`broadcast`]: success-rate-ranked publish fan-out with a
//!   worker pool, TTL dedup cache, and NIP-65 peer discovery
//! - [`mirror`]: the continuous since-now subscription feeding upstream
//!   events into the local broadcast sink
//! - [`probe`]: startup NIP-11 capability probing
//!
//! # Architecture
//!
//! ```text
//!   save ───────► BroadcastSystem ──► ranker ─► top-N ∪ mandatory
//!                     │   cache            │
//!                     ▼                    ▼
//!   query ──────► QueryPool ────────► SessionRegistry ──► upstream peers
//!                     ▲                    ▲
//!   subscribers ◄── MirrorManager ─────────┘
//! ```

pub mod broadcast;
pub mod error;
pub mod mirror;
pub mod pool;
pub mod probe;
pub mod ranker;
pub mod session;

pub use broadcast::{BroadcastConfig, BroadcastSystem};
pub use error::{parse_error_prefix, ClientError, PrefixedError, Result, OK_ERROR_PREFIXES};
pub use mirror::MirrorManager;
pub use pool::{QueryPool, QueryStream, MAX_CONCURRENT_FANOUTS};
pub use probe::probe_countable;
pub use ranker::{PeerRanker, PeerScore};
pub use session::{RelaySession, SessionRegistry, SessionState, SubscriptionMessage};
