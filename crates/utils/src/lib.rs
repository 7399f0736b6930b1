//! Shared utilities for the Prism relay aggregator.
//!
//! - [`json`]: an insertion-ordered JSON value type; downstream consumers of
//!   the stats and health endpoints depend on stable field order
//! - [`stats`]: the process-wide stats-provider registry
//! - [`health`]: consecutive-failure health derivation
//! - [`logging`]: `VERBOSE` option mapping onto tracing filter directives

pub mod health;
pub mod json;
pub mod logging;
pub mod stats;

pub use health::HealthState;
pub use json::{JsonObject, JsonValue};
pub use stats::{registry, StatsProvider, StatsRegistry};
