//! Bootstrap from the well-known seed hosts.
//!
//! Seeds are asked directly (no onion path exists yet) for the full list of
//! service nodes through their JSON-RPC endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use snodekit_shared::constants::{DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SEED_URLS};
use snodekit_shared::Snode;

use crate::error::PoolError;
use crate::link::SnodeLink;
use crate::node_pool::SeedSource;
use crate::retry::{retry, Attempt, RetryPolicy};

/// Body of a `get_n_service_nodes` call, as sent to seeds and (wrapped in
/// `oxend_request`) to snodes.
pub fn service_nodes_params() -> Value {
    json!({
        "active_only": true,
        "fields": {
            "public_ip": true,
            "storage_port": true,
            "pubkey_x25519": true,
            "pubkey_ed25519": true,
            "storage_server_version": true,
        }
    })
}

#[derive(Deserialize)]
struct ServiceNodeState {
    public_ip: Option<String>,
    storage_port: Option<u16>,
    pubkey_x25519: Option<String>,
    pubkey_ed25519: Option<String>,
    #[serde(default)]
    storage_server_version: Vec<u16>,
}

/// Pull nodes out of a `get_n_service_nodes` result. Entries missing a
/// field or at an unroutable ip are skipped.
pub fn parse_service_node_states(result: &Value) -> Result<Vec<Snode>, PoolError> {
    let states = result
        .get("service_node_states")
        .cloned()
        .ok_or_else(|| PoolError::Seed("missing service_node_states".to_string()))?;
    let states: Vec<ServiceNodeState> =
        serde_json::from_value(states).map_err(|e| PoolError::Seed(e.to_string()))?;

    let total = states.len();
    let nodes: Vec<Snode> = states
        .into_iter()
        .filter_map(|s| {
            Some(Snode {
                ip: s.public_ip?,
                port: s.storage_port?,
                pubkey_x25519: s.pubkey_x25519?,
                pubkey_ed25519: s.pubkey_ed25519?,
                storage_server_version: s.storage_server_version,
            })
        })
        .filter(Snode::is_routable)
        .collect();

    if nodes.len() < total {
        debug!(skipped = total - nodes.len(), "skipped incomplete service node entries");
    }
    Ok(nodes)
}

pub struct SeedNodeClient {
    link: Arc<dyn SnodeLink>,
    seed_urls: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SeedNodeClient {
    pub fn new(link: Arc<dyn SnodeLink>, seed_urls: Vec<String>) -> Self {
        let seed_urls = if seed_urls.is_empty() {
            DEFAULT_SEED_URLS.iter().map(|s| s.to_string()).collect()
        } else {
            seed_urls
        };
        Self {
            link,
            seed_urls,
            retry: RetryPolicy::new(4, 2, Duration::from_millis(500), Duration::from_secs(5)),
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_from(&self, seed_url: &str) -> Result<Vec<Snode>, PoolError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": "get_n_service_nodes",
            "params": service_nodes_params(),
        });

        let raw = self
            .link
            .post_seed(seed_url, body.to_string().into_bytes(), self.timeout)
            .await
            .map_err(|e| PoolError::Seed(format!("{seed_url}: {e}")))?;

        let response: Value =
            serde_json::from_slice(&raw).map_err(|e| PoolError::Seed(e.to_string()))?;
        let result = response
            .get("result")
            .ok_or_else(|| PoolError::Seed("response has no result".to_string()))?;

        let nodes = parse_service_node_states(result)?;
        if nodes.is_empty() {
            return Err(PoolError::Seed(format!("{seed_url} returned no nodes")));
        }
        Ok(nodes)
    }
}

#[async_trait]
impl SeedSource for SeedNodeClient {
    async fn fetch_snode_pool(&self) -> Result<Vec<Snode>, PoolError> {
        let result = retry(&self.retry, "seed fetch", |_| async move {
            let seed_url = self
                .seed_urls
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| Attempt::Abort(PoolError::Seed("no seed urls".to_string())))?;
            self.fetch_from(&seed_url).await.map_err(Attempt::Retry)
        })
        .await;

        if let Err(e) = &result {
            warn!(error = %e, "all seed attempts failed");
        }
        result
    }
}
