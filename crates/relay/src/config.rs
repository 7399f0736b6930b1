//! Runtime configuration from flags and environment.
//!
//! Every option is available as a flag and an environment variable; the flag
//! wins. Query remotes are mandatory: startup aborts without at least one.

use clap::Parser;
use prism_core::{derive_public_key, generate_secret_key, parse_secret_key, KeyError};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Relay aggregator configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "prism-relay", about = "Nostr relay aggregator", version)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "ADDR", default_value = "0.0.0.0:3337")]
    pub addr: SocketAddr,

    /// Comma-separated upstream relay URLs used for queries and mirroring
    #[arg(long, env = "QUERY_REMOTES", value_delimiter = ',')]
    pub query_remotes: Vec<String>,

    /// Verbose logging: empty for off, "1"/"true"/"all" for everything, or
    /// a comma list of module / module.method names
    #[arg(long, env = "VERBOSE", default_value = "")]
    pub verbose: String,

    /// Relay name served in the information document
    #[arg(long, env = "RELAY_NAME", default_value = "prism")]
    pub relay_name: String,

    /// Relay description
    #[arg(long, env = "RELAY_DESCRIPTION")]
    pub relay_description: Option<String>,

    /// Relay contact
    #[arg(long, env = "RELAY_CONTACT")]
    pub relay_contact: Option<String>,

    /// Relay icon URL
    #[arg(long, env = "RELAY_ICON")]
    pub relay_icon: Option<String>,

    /// Relay banner URL
    #[arg(long, env = "RELAY_BANNER")]
    pub relay_banner: Option<String>,

    /// Public service URL
    #[arg(long, env = "RELAY_SERVICE_URL")]
    pub relay_service_url: Option<String>,

    /// Upstream-auth secret key, raw hex or bech32 nsec
    #[arg(long, env = "RELAY_SECKEY", hide_env_values = true)]
    pub relay_seckey: Option<String>,

    /// Relay public key; derived from the secret key when absent
    #[arg(long, env = "RELAY_PUBKEY")]
    pub relay_pubkey: Option<String>,

    /// Maximum non-mandatory peers per broadcast
    #[arg(long, env = "MAX_PUBLISH_RELAYS", default_value_t = 50)]
    pub max_publish_relays: usize,

    /// Broadcast worker pool size; twice the logical cores when absent
    #[arg(long, env = "BROADCAST_WORKERS")]
    pub broadcast_workers: Option<usize>,

    /// Broadcast dedup window, e.g. "5m" or "300s"
    #[arg(long, env = "BROADCAST_CACHE_TTL", default_value = "5m", value_parser = parse_duration)]
    pub broadcast_cache_ttl: Duration,

    /// Comma-separated seed relays; non-empty activates the broadcast system
    #[arg(long, env = "BROADCAST_SEED_RELAYS", value_delimiter = ',')]
    pub broadcast_seed_relays: Vec<String>,

    /// Comma-separated always-included publish targets
    #[arg(long, env = "BROADCAST_MANDATORY_RELAYS", value_delimiter = ',')]
    pub broadcast_mandatory_relays: Vec<String>,

    /// Periodic peer-discovery cadence, e.g. "24h"
    #[arg(long, env = "BROADCAST_REFRESH_INTERVAL", default_value = "24h", value_parser = parse_duration)]
    pub broadcast_refresh_interval: Duration,
}

/// Resolved signing material for upstream authentication.
pub struct KeyMaterial {
    pub secret_key: bitcoin::secp256k1::SecretKey,
    pub pubkey: String,
}

impl Config {
    /// Query remotes with whitespace and empty entries dropped.
    pub fn query_remotes(&self) -> Vec<String> {
        self.query_remotes
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }

    /// Startup validation: at least one query remote is mandatory.
    pub fn validate(&self) -> Result<(), String> {
        if self.query_remotes().is_empty() {
            return Err(
                "no query remotes provided - set QUERY_REMOTES or --query-remotes".to_string(),
            );
        }
        Ok(())
    }

    /// Broadcast worker pool size, defaulting to twice the logical cores.
    pub fn broadcast_workers(&self) -> usize {
        self.broadcast_workers
            .unwrap_or_else(|| num_cpus::get() * 2)
            .max(1)
    }

    /// Decode the configured secret key, generating one when absent, and
    /// derive the public key unless explicitly configured.
    pub fn resolve_keys(&self) -> Result<KeyMaterial, KeyError> {
        let secret_key = match &self.relay_seckey {
            Some(input) => parse_secret_key(input)?,
            None => {
                info!("no relay secret key configured, generating one");
                parse_secret_key(&generate_secret_key())?
            }
        };
        let pubkey = match &self.relay_pubkey {
            Some(pubkey) => pubkey.clone(),
            None => derive_public_key(&secret_key),
        };
        Ok(KeyMaterial { secret_key, pubkey })
    }
}

/// Parse durations like "300", "500ms", "300s", "5m", "24h".
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (number, unit) = match input.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {input}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        "d" => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        other => Err(format!("invalid duration unit: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["prism-relay"];
        argv.extend(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn query_remotes_are_split_and_trimmed() {
        let config = parse(&["--query-remotes", "wss://a, wss://b ,,"]);
        assert_eq!(config.query_remotes(), vec!["wss://a", "wss://b"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn startup_requires_query_remotes() {
        let config = parse(&[]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = parse(&["--query-remotes", "wss://a"]);
        assert_eq!(config.max_publish_relays, 50);
        assert_eq!(config.broadcast_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.broadcast_refresh_interval, Duration::from_secs(86_400));
        assert_eq!(config.relay_name, "prism");
        assert!(config.broadcast_workers() >= 1);
    }

    #[test]
    fn keys_resolve_from_hex_and_generate_when_absent() {
        let seckey = generate_secret_key();
        let config = parse(&["--query-remotes", "wss://a", "--relay-seckey", &seckey]);
        let keys = config.resolve_keys().unwrap();
        assert_eq!(keys.pubkey, derive_public_key(&keys.secret_key));

        let generated = parse(&["--query-remotes", "wss://a"]).resolve_keys().unwrap();
        assert_eq!(generated.pubkey.len(), 64);
    }

    #[test]
    fn explicit_pubkey_wins_over_derivation() {
        let seckey = generate_secret_key();
        let config = parse(&[
            "--query-remotes",
            "wss://a",
            "--relay-seckey",
            &seckey,
            "--relay-pubkey",
            "ab12",
        ]);
        assert_eq!(config.resolve_keys().unwrap().pubkey, "ab12");
    }
}
