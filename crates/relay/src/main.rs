//! Prism relay aggregator binary.

use clap::Parser;
use prism_client::{
    probe_countable, BroadcastConfig, BroadcastSystem, MirrorManager, QueryPool, SessionRegistry,
};
use prism_core::RelayInformationDocument;
use prism_relay::{routes, Config, Policy, ServerState};
use prism_utils::logging::verbose_filter;
use prism_utils::registry;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Capacity of the mirror-to-subscribers broadcast sink.
const MIRROR_SINK_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let started_at = Instant::now();
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(verbose_filter(&config.verbose)))
        .init();

    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    let query_remotes = config.query_remotes();

    let keys = match config.resolve_keys() {
        Ok(keys) => keys,
        Err(e) => {
            error!("resolving relay keys: {e}");
            return ExitCode::FAILURE;
        }
    };

    let registry_sessions = Arc::new(SessionRegistry::new(Some(keys.secret_key)));

    // capability probe decides which peers answer COUNT
    let pool = Arc::new(QueryPool::new(
        Arc::clone(&registry_sessions),
        query_remotes.clone(),
    ));
    pool.set_countable(probe_countable(&query_remotes).await);

    // the broadcast system only runs when seeds are configured
    let broadcast_system = if config.broadcast_seed_relays.iter().any(|s| !s.trim().is_empty()) {
        let system = BroadcastSystem::new(
            BroadcastConfig {
                max_publish_relays: config.max_publish_relays,
                workers: config.broadcast_workers(),
                seed_relays: config.broadcast_seed_relays.clone(),
                mandatory_relays: config.broadcast_mandatory_relays.clone(),
                cache_ttl: config.broadcast_cache_ttl,
                refresh_interval: config.broadcast_refresh_interval,
                owner_pubkey: Some(keys.pubkey.clone()),
                ..Default::default()
            },
            Arc::clone(&registry_sessions),
        );
        system.start().await;
        Some(system)
    } else {
        info!("no broadcast seed relays configured, publish fan-out disabled");
        None
    };

    let (mirror_sink, _) = broadcast::channel(MIRROR_SINK_CAPACITY);
    let mirror = MirrorManager::new(
        query_remotes.clone(),
        Arc::clone(&registry_sessions),
        mirror_sink.clone(),
    );
    if let Err(e) = mirror.start().await {
        error!("starting mirror: {e}");
        return ExitCode::FAILURE;
    }

    let store = prism_relay::AggregateStore::new(Arc::clone(&pool), broadcast_system.clone());

    registry().register(store.clone());
    registry().register(pool.clone());
    registry().register(mirror.clone());
    if let Some(system) = &broadcast_system {
        registry().register(system.clone());
    }

    let mut info = RelayInformationDocument {
        name: Some(config.relay_name.clone()),
        description: config.relay_description.clone(),
        contact: config.relay_contact.clone(),
        pubkey: Some(keys.pubkey.clone()),
        software: Some("https://github.com/prism-relay/prism".to_string()),
        version: Some(prism_relay::VERSION.to_string()),
        icon: config.relay_icon.clone(),
        banner: config.relay_banner.clone(),
        ..Default::default()
    };
    info.ensure_nips(&[11, 42, 45]);

    let state = Arc::new(ServerState {
        store,
        pool,
        broadcast: broadcast_system,
        mirror: mirror.clone(),
        policy: Arc::new(Policy::default()),
        mirror_sink,
        info,
        service_url: config.relay_service_url.clone(),
        started_at,
    });

    info!(addr = %config.addr, remotes = query_remotes.len(), "starting {}", prism_relay::PROJECT_NAME);
    warp::serve(routes(state)).run(config.addr).await;

    mirror.close().await;
    registry_sessions.close_all().await;
    ExitCode::SUCCESS
}
