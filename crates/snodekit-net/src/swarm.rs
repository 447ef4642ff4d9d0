//! Which snodes hold a given pubkey's data.
//!
//! Swarms are cached in memory on top of the store, keyed by pubkey and
//! holding ed25519 keys. Reads resolve the keys against the current pool,
//! so a node that left the pool silently leaves every swarm too.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use snodekit_shared::constants::MIN_SWARM_SNODE_COUNT;
use snodekit_shared::{short_key, Snode};
use snodekit_store::SwarmStore;

use crate::error::{NetError, SnodeApiError, TransportError};
use crate::locks::{read, write};
use crate::node_pool::{NodePool, PoolRefreshListener, RefreshSource};
use crate::retry::{retry, Attempt, RetryPolicy};
use crate::snode_api::SwarmSource;

#[derive(Debug, Clone)]
pub struct SwarmDirectoryConfig {
    pub min_swarm_count: usize,
    /// Retries of one `get_swarm` against the same snode.
    pub same_target_retry: RetryPolicy,
    /// Retries with a freshly picked snode once a target gave up.
    pub new_target_retry: RetryPolicy,
}

impl Default for SwarmDirectoryConfig {
    fn default() -> Self {
        Self {
            min_swarm_count: MIN_SWARM_SNODE_COUNT,
            same_target_retry: RetryPolicy::new(3, 2, Duration::from_millis(100), Duration::from_secs(2)),
            new_target_retry: RetryPolicy::new(3, 2, Duration::from_millis(100), Duration::from_secs(10)),
        }
    }
}

pub struct SwarmDirectory {
    config: SwarmDirectoryConfig,
    pool: Arc<NodePool>,
    store: Arc<dyn SwarmStore>,
    source: Arc<dyn SwarmSource>,
    cache: RwLock<HashMap<String, Vec<String>>>,
}

impl SwarmDirectory {
    pub fn new(
        config: SwarmDirectoryConfig,
        pool: Arc<NodePool>,
        store: Arc<dyn SwarmStore>,
        source: Arc<dyn SwarmSource>,
    ) -> Self {
        Self {
            config,
            pool,
            store,
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The known swarm of `pubkey`, limited to nodes still in the pool.
    /// Fetched from the network when fewer than `min_swarm_count` remain.
    pub async fn get_swarm(&self, pubkey: &str) -> Vec<Snode> {
        let ids = self.cached_or_stored(pubkey).await;
        self.pool.get_from_cache_or_fetch(0).await;

        let usable: Vec<Snode> = ids.iter().filter_map(|id| self.pool.find(id)).collect();
        if usable.len() >= self.config.min_swarm_count {
            return usable;
        }

        debug!(
            pubkey = %short_key(pubkey),
            usable = usable.len(),
            "swarm too small, fetching a fresh one"
        );
        self.fetch_fresh(pubkey).await
    }

    /// Ask the network for `pubkey`'s swarm, bypassing the cache. An empty
    /// result means no snode could be asked right now; the previous swarm is
    /// left in place in that case.
    pub async fn fetch_fresh(&self, pubkey: &str) -> Vec<Snode> {
        let mut swarm = match self.request_swarm(pubkey).await {
            Ok(swarm) => swarm,
            Err(e) => {
                warn!(pubkey = %short_key(pubkey), error = %e, "could not fetch swarm");
                return Vec::new();
            }
        };

        swarm.shuffle(&mut rand::thread_rng());
        self.update(pubkey, &swarm).await;
        swarm
    }

    /// Remove one node from `pubkey`'s swarm. Unknown nodes are ignored.
    pub async fn drop_node_if_present(&self, pubkey: &str, pubkey_ed25519: &str) {
        let mut ids = self.cached_or_stored(pubkey).await;
        let before = ids.len();
        ids.retain(|id| id != pubkey_ed25519);
        if ids.len() == before {
            return;
        }

        info!(
            pubkey = %short_key(pubkey),
            node = %short_key(pubkey_ed25519),
            remaining = ids.len(),
            "dropping snode from swarm"
        );
        self.store_ids(pubkey, ids).await;
    }

    /// Replace `pubkey`'s swarm wholesale.
    pub async fn update(&self, pubkey: &str, nodes: &[Snode]) {
        let ids = nodes.iter().map(|n| n.pubkey_ed25519.clone()).collect();
        self.store_ids(pubkey, ids).await;
    }

    /// Size of the cached swarm, without touching the store.
    pub fn cached_size(&self, pubkey: &str) -> Option<usize> {
        read(&self.cache).get(pubkey).map(Vec::len)
    }

    async fn cached_or_stored(&self, pubkey: &str) -> Vec<String> {
        if let Some(ids) = read(&self.cache).get(pubkey) {
            return ids.clone();
        }

        match self.store.get_swarm_nodes_for_pubkey(pubkey).await {
            Ok(ids) => {
                write(&self.cache).insert(pubkey.to_string(), ids.clone());
                ids
            }
            Err(e) => {
                warn!(pubkey = %short_key(pubkey), error = %e, "could not read swarm from store");
                Vec::new()
            }
        }
    }

    async fn store_ids(&self, pubkey: &str, ids: Vec<String>) {
        if let Err(e) = self
            .store
            .update_swarm_nodes_for_pubkey(pubkey, ids.clone())
            .await
        {
            warn!(pubkey = %short_key(pubkey), error = %e, "could not persist swarm");
        }
        write(&self.cache).insert(pubkey.to_string(), ids);
    }

    /// Retries against one random target, then moves on to new targets.
    async fn request_swarm(&self, pubkey: &str) -> Result<Vec<Snode>, NetError> {
        retry(&self.config.new_target_retry, "swarm fetch", |_| async move {
            let target = self
                .pool
                .get_random(&[])
                .await
                .map_err(|e| Attempt::Retry(NetError::Pool(e)))?;
            self.request_swarm_from(&target, pubkey)
                .await
                .map_err(|e| Attempt::Retry(NetError::Api(e)))
        })
        .await
    }

    async fn request_swarm_from(&self, target: &Snode, pubkey: &str) -> Result<Vec<Snode>, SnodeApiError> {
        let swarm = retry(&self.config.same_target_retry, "swarm fetch from target", |_| async move {
            self.source
                .fetch_swarm(target, pubkey)
                .await
                .map_err(|e| match e {
                    SnodeApiError::Transport(TransportError::DestinationUnreachable(_)) => Attempt::Abort(e),
                    other => Attempt::Retry(other),
                })
        })
        .await?;

        // Pool entries carry the version the swarm reply leaves out.
        Ok(swarm
            .into_iter()
            .filter(Snode::is_routable)
            .map(|node| self.pool.find(&node.pubkey_ed25519).unwrap_or(node))
            .collect())
    }
}

impl PoolRefreshListener for SwarmDirectory {
    /// Consensus refreshes prune stored swarms, so cached copies are stale.
    fn on_pool_refreshed(&self, source: RefreshSource) {
        if source == RefreshSource::Consensus {
            write(&self.cache).clear();
        }
    }
}
