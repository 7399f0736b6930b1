//! Nostr protocol vocabulary for the Prism relay aggregator.
//!
//! This crate provides the protocol-level types shared by the aggregator's
//! upstream client machinery and its client-facing relay surface:
//!
//! - NIP-01 events: hashing, signing, verification
//! - Filters with arbitrary `#`-keyed tag constraints
//! - Wire messages in both directions (client→relay and relay→client)
//! - Key handling: hex and bech32 (`nsec`/`npub`) forms
//! - NIP-11 relay information documents

mod event;
mod filter;
mod keys;
mod message;
mod nip11;

pub use event::{
    Event, EventError, EventTemplate, now_timestamp, serialize_event, KIND_CLIENT_AUTH,
    KIND_DELETION, KIND_RELAY_LIST, KIND_SHORT_TEXT_NOTE,
};
pub use filter::Filter;
pub use keys::{
    decode_npub, decode_nsec, derive_public_key, encode_npub, encode_nsec, finalize_event,
    generate_secret_key, parse_secret_key, verify_event, KeyError,
};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use nip11::{RelayInformationDocument, RelayLimitation, RELAY_INFO_ACCEPT_HEADER};
