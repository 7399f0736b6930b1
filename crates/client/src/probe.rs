//! Startup NIP-11 capability probing.
//!
//! Each query peer's information document is fetched over HTTP (the ws/wss
//! URL rewritten to http/https) with `Accept: application/nostr+json` and a
//! 4-second budget. Peers advertising NIP-45 form the countable subset; any
//! probe failure silently keeps the peer out of that subset without removing
//! it from the query set.

use prism_core::{RelayInformationDocument, RELAY_INFO_ACCEPT_HEADER};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// NIP number for event counts.
const NIP_COUNT: u16 = 45;

/// Probe budget per peer.
const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// Rewrite a relay WebSocket URL to its HTTP document URL.
fn probe_url(relay_url: &str) -> Option<String> {
    let mut url = Url::parse(relay_url.trim()).ok()?;
    match url.scheme() {
        "ws" => url.set_scheme("http").ok()?,
        "wss" => url.set_scheme("https").ok()?,
        _ => return None,
    }
    url.set_path("/");
    Some(url.to_string())
}

/// Fetch a peer's relay information document.
async fn fetch_info(client: &reqwest::Client, relay_url: &str) -> Option<RelayInformationDocument> {
    let target = probe_url(relay_url)?;
    debug!(relay = %relay_url, probe = %target, "probing relay information document");
    let response = client
        .get(&target)
        .header("Accept", RELAY_INFO_ACCEPT_HEADER)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        debug!(relay = %relay_url, status = %response.status(), "non-success probe response");
        return None;
    }
    response.json::<RelayInformationDocument>().await.ok()
}

/// Probe every query peer and return the subset advertising NIP-45.
pub async fn probe_countable(query_urls: &[String]) -> Vec<String> {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return Vec::new(),
    };

    let mut countable = Vec::new();
    for url in query_urls {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        match fetch_info(&client, url).await {
            Some(info) if info.supports_nip(NIP_COUNT) => {
                debug!(relay = %url, "advertises NIP-45; countable");
                countable.push(url.to_string());
            }
            Some(_) => debug!(relay = %url, "does not advertise NIP-45"),
            None => debug!(relay = %url, "capability probe failed"),
        }
    }
    info!(
        countable = countable.len(),
        total = query_urls.len(),
        "capability probe finished"
    );
    countable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_ws_schemes() {
        assert_eq!(
            probe_url("ws://relay.example.com:8080"),
            Some("http://relay.example.com:8080/".to_string())
        );
        assert_eq!(
            probe_url("wss://relay.example.com/nested/path"),
            Some("https://relay.example.com/".to_string())
        );
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert_eq!(probe_url("https://relay.example.com"), None);
        assert_eq!(probe_url("not a url"), None);
    }

    #[test]
    fn countable_requires_nip45() {
        let with: RelayInformationDocument =
            serde_json::from_str(r#"{"supported_nips":[11,42,45]}"#).unwrap();
        let without: RelayInformationDocument =
            serde_json::from_str(r#"{"supported_nips":[11,42]}"#).unwrap();
        assert!(with.supports_nip(NIP_COUNT));
        assert!(!without.supports_nip(NIP_COUNT));
    }
}
