//! Daemon configuration loaded from environment variables.
//!
//! Every setting has a default so the daemon starts with zero configuration
//! against mainnet.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use snodekit_net::{NetworkConfig, NodePoolConfig, PollerConfig};
use snodekit_shared::constants::POLL_ACTIVE_INTERVAL_MS;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// SQLite database file.
    /// Env: `SNODEKIT_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// ed25519 identity, created on first start.
    /// Env: `SNODEKIT_IDENTITY_FILE`
    /// Default: `./snodekit-identity.json`
    pub identity_file: PathBuf,

    /// Seed hosts, comma separated.
    /// Env: `SNODEKIT_SEED_URLS`
    /// Default: the built-in mainnet seeds.
    pub seed_urls: Vec<String>,

    /// Lower consensus agreement for small local networks.
    /// Env: `SNODEKIT_LOCAL_DEVNET` (true/false)
    pub local_devnet: bool,

    /// Address of the status API.
    /// Env: `SNODEKIT_STATUS_ADDR`
    /// Default: `127.0.0.1:8787`
    pub status_addr: SocketAddr,

    /// v2 groups (`03…`) to track.
    /// Env: `SNODEKIT_GROUPS`, comma separated.
    pub groups: Vec<String>,

    /// Legacy groups (`05…`) to track.
    /// Env: `SNODEKIT_LEGACY_GROUPS`, comma separated.
    pub legacy_groups: Vec<String>,

    /// Env: `SNODEKIT_POLL_INTERVAL_MS`
    pub poll_interval: Duration,

    /// Resolve seed hosts over DNS-over-HTTPS.
    /// Env: `SNODEKIT_USE_DOH` (true/false)
    /// Default: `true`
    pub use_doh: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            identity_file: PathBuf::from("./snodekit-identity.json"),
            seed_urls: Vec::new(),
            local_devnet: false,
            status_addr: ([127, 0, 0, 1], 8787).into(),
            groups: Vec::new(),
            legacy_groups: Vec::new(),
            poll_interval: Duration::from_millis(POLL_ACTIVE_INTERVAL_MS as u64),
            use_doh: true,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = get("SNODEKIT_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(path) = get("SNODEKIT_IDENTITY_FILE").filter(|p| !p.is_empty()) {
            config.identity_file = PathBuf::from(path);
        }

        if let Some(urls) = get("SNODEKIT_SEED_URLS") {
            config.seed_urls = split_list(&urls);
        }

        if let Some(val) = get("SNODEKIT_LOCAL_DEVNET") {
            config.local_devnet = is_true(&val);
        }

        if let Some(addr) = get("SNODEKIT_STATUS_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.status_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid SNODEKIT_STATUS_ADDR, using default"),
            }
        }

        if let Some(groups) = get("SNODEKIT_GROUPS") {
            config.groups = split_list(&groups);
        }

        if let Some(groups) = get("SNODEKIT_LEGACY_GROUPS") {
            config.legacy_groups = split_list(&groups);
        }

        if let Some(val) = get("SNODEKIT_POLL_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid SNODEKIT_POLL_INTERVAL_MS, using default"),
            }
        }

        if let Some(val) = get("SNODEKIT_USE_DOH") {
            config.use_doh = is_true(&val);
        }

        config
    }

    pub fn network_config(&self) -> NetworkConfig {
        let pool = if self.local_devnet {
            NodePoolConfig::devnet()
        } else {
            NodePoolConfig::default()
        };
        NetworkConfig {
            pool,
            seed_urls: self.seed_urls.clone(),
            poller: PollerConfig {
                cycle_interval: self.poll_interval,
                ..PollerConfig::default()
            },
            ..NetworkConfig::default()
        }
    }
}

fn is_true(val: &str) -> bool {
    val != "false" && val != "0"
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
