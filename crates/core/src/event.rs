//! NIP-01 events.
//!
//! An event is a signed, content-addressed message: its `id` is the sha256 of
//! the canonical serialization `[0, pubkey, created_at, kind, tags, content]`
//! and its `sig` is a schnorr signature over that digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Kind for short text notes.
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;

/// Kind for deletion requests (NIP-09).
pub const KIND_DELETION: u16 = 5;

/// Kind for relay list metadata (NIP-65), used by broadcast discovery.
pub const KIND_RELAY_LIST: u16 = 10002;

/// Kind for client authentication events (NIP-42).
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Errors that can occur when constructing or serializing events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid event field: {0}")]
    InvalidField(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte sha256 of the canonical serialization, lowercase hex
    pub id: String,
    /// 32-byte x-only public key of the author, lowercase hex
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Arbitrary tags; each tag is a list of strings whose first element names it
    pub tags: Vec<Vec<String>>,
    /// Arbitrary content
    pub content: String,
    /// 64-byte schnorr signature over the id digest, lowercase hex
    pub sig: String,
}

impl Event {
    /// Values of every tag whose name matches, e.g. `tag_values("e")` yields
    /// the second element of each `["e", ...]` tag.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }
}

/// An unsigned event precursor; [`crate::finalize_event`] turns it into an
/// [`Event`] by computing the id and signing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Current Unix timestamp in seconds.
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Canonical NIP-01 serialization of an event: the JSON array
/// `[0, pubkey, created_at, kind, tags, content]` with no whitespace.
pub fn serialize_event(pubkey: &str, template: &EventTemplate) -> Result<String, EventError> {
    let arr = serde_json::json!([
        0,
        pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    ]);
    Ok(serde_json::to_string(&arr)?)
}

/// Sha256 digest of the canonical serialization; this is the event id.
pub(crate) fn event_digest(pubkey: &str, template: &EventTemplate) -> Result<[u8; 32], EventError> {
    let serialized = serialize_event(pubkey, template)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(hasher.finalize().into())
}
