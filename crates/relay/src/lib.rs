//! The Prism relay aggregator.
//!
//! Prism appears as a single Nostr relay while fanning publishes out across
//! a ranked upstream set, merging queries from its configured query peers,
//! and mirroring upstream activity to connected subscribers.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        warp: WebSocket + HTTP surfaces       │
//! │   NIP-01 / NIP-11 / stats / health routes    │
//! └────────────────────┬─────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────┐
//! │  policy layer → intent classifier → store    │
//! └───────┬──────────────────────────┬───────────┘
//!         │                          │
//!   QueryPool (fan-out/fan-in)  BroadcastSystem (ranked fan-out)
//!         │                          │
//!         └────── SessionRegistry ───┘
//!                      ▲
//!             MirrorManager (since-now feed)
//! ```

pub mod classify;
pub mod config;
pub mod policy;
pub mod server;
pub mod store;

pub use classify::{is_deletion_check, DeletionCache, RequestContext};
pub use config::Config;
pub use policy::{Policy, PolicyConfig};
pub use server::{routes, ServerState};
pub use store::AggregateStore;

/// Crate version served in NIP-11 and the health document.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Project name used in logs and the landing page.
pub const PROJECT_NAME: &str = "prism";
