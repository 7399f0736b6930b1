//! NIP-11: relay information documents.
//!
//! Relays serve a JSON metadata document over HTTP when the request carries
//! `Accept: application/nostr+json`. The aggregator both serves its own
//! document and probes upstream peers' documents for advertised capabilities.

use serde::{Deserialize, Serialize};

/// Accept-header value that selects the relay information document.
pub const RELAY_INFO_ACCEPT_HEADER: &str = "application/nostr+json";

/// Relay information document. All fields are optional; unknown fields are
/// ignored on parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayInformationDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    /// NIP numbers implemented by the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_nips: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<RelayLimitation>,
}

/// Server limitations advertised in the information document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayLimitation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_event_tags: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,
}

impl RelayInformationDocument {
    /// Whether the document advertises a NIP.
    pub fn supports_nip(&self, nip: u16) -> bool {
        self.supported_nips
            .as_ref()
            .map(|nips| nips.contains(&nip))
            .unwrap_or(false)
    }

    /// Ensure the listed NIPs are advertised, preserving existing entries.
    pub fn ensure_nips(&mut self, nips: &[u16]) {
        let list = self.supported_nips.get_or_insert_with(Vec::new);
        for nip in nips {
            if !list.contains(nip) {
                list.push(*nip);
            }
        }
    }
}
