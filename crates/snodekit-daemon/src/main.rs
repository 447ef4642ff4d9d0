//! # snodekit-daemon
//!
//! Headless storage swarm client.
//!
//! This binary provides:
//! - **Snode pool and onion paths**, bootstrapped from the seed hosts and
//!   refreshed from the network daily
//! - **Swarm polling** for our own account and the configured groups
//! - **Status API** (axum) for health checks and network state
//! - **Maintenance** of expired retrieve cursors and seen message hashes

mod api;
mod config;
mod hooks;
mod identity;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use snodekit_net::{HttpLink, IdentityAuth, PollerHooks, SnodeNetwork};
use snodekit_shared::short_key;
use snodekit_store::{Database, SqliteStore, SwarmStore};

use crate::api::AppState;
use crate::config::DaemonConfig;
use crate::hooks::LoggingHooks;

const POOL_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const CONNECTIVITY_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,snodekit_daemon=debug,snodekit_net=debug")),
        )
        .init();

    info!("Starting snodekit daemon v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and identity
    // -----------------------------------------------------------------------
    let config = DaemonConfig::from_env();
    info!(?config, "Loaded configuration");

    let identity = identity::load_or_create(&config.identity_file)?;
    let account_id = identity.account_id();
    info!(account = %short_key(&account_id), "Loaded identity");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let store: Arc<dyn SwarmStore> = Arc::new(SqliteStore::new(database));
    let link = Arc::new(HttpLink::new(config.use_doh)?);

    let hooks = Arc::new(LoggingHooks::new(
        config.groups.clone(),
        config.legacy_groups.clone(),
    ));
    let network = Arc::new(SnodeNetwork::new(
        config.network_config(),
        store,
        link,
        account_id.clone(),
        PollerHooks {
            membership: hooks.clone(),
            configs: hooks.clone(),
            pipeline: hooks,
            auth: Arc::new(IdentityAuth::new(identity)),
        },
    ));
    network.start().await;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Daily pool refresh from snode consensus
    let net = network.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POOL_REFRESH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let pool = net.pool().force_refresh().await;
            info!(size = pool.len(), "Daily snode pool refresh done");
        }
    });

    // Hourly cleanup of expired cursors and seen hashes
    let net = network.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let report = net.cleanup_expired().await;
            debug!(
                seen_messages = report.seen_messages,
                last_hashes = report.last_hashes,
                "Expired rows cleaned"
            );
        }
    });

    // Probe connectivity while offline so presence recovers without traffic
    let net = network.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CONNECTIVITY_PROBE_INTERVAL);
        loop {
            interval.tick().await;
            if net.presence().is_online() {
                continue;
            }
            let online = net.transport().check_connectivity().await;
            info!(online, "Connectivity probe");
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the status API (blocks until shutdown)
    // -----------------------------------------------------------------------
    let state = AppState {
        network: network.clone(),
        account_id,
    };
    tokio::select! {
        result = api::serve(state, config.status_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Status API failed");
                network.stop();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    network.stop();
    Ok(())
}
