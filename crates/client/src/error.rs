//! Error types for upstream operations.
//!
//! Transport failures stay internal (counted, logged, never shown to
//! clients verbatim); semantic rejections from upstream OK messages carry a
//! machine-readable prefix and are surfaced when an entire fan-out fails.

use thiserror::Error;

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// The NIP-01 standardized machine-readable OK-message prefixes.
pub const OK_ERROR_PREFIXES: [&str; 9] = [
    "duplicate",
    "pow",
    "blocked",
    "rate-limited",
    "invalid",
    "restricted",
    "mute",
    "error",
    "auth-required",
];

/// A rejection carrying a machine-readable prefix from an upstream relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct PrefixedError {
    pub prefix: String,
    pub message: String,
    pub relay_url: String,
}

impl std::fmt::Display for PrefixedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.relay_url.is_empty() {
            write!(f, "{}: {}", self.prefix, self.message)
        } else {
            write!(f, "{}: {} ({})", self.prefix, self.message, self.relay_url)
        }
    }
}

/// Split an upstream OK message into its standardized prefix and remainder.
/// Returns `None` for the prefix when the message does not start with one of
/// the nine recognized prefixes.
pub fn parse_error_prefix(message: &str) -> (Option<&'static str>, String) {
    let message = message.trim();
    if let Some(idx) = message.find(": ") {
        let candidate = message[..idx].trim();
        for prefix in OK_ERROR_PREFIXES {
            if candidate == prefix {
                return (Some(prefix), message[idx + 2..].trim().to_string());
            }
        }
    }
    (None, message.to_string())
}

/// Errors that can occur in upstream relay operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("key error: {0}")]
    Key(#[from] prism_core::KeyError),

    #[error("no upstream peers available (configured: {0})")]
    NoPeersAvailable(usize),

    #[error("{0}")]
    Rejected(PrefixedError),

    /// Every peer failed without a parseable prefix; carries the joined
    /// per-peer transport errors.
    #[error("{0}")]
    BroadcastFailed(String),
}

impl ClientError {
    /// The prefixed rejection, when this error carries one.
    pub fn prefixed(&self) -> Option<&PrefixedError> {
        match self {
            ClientError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}
