//! Process-wide pool of known storage nodes.
//!
//! The pool is bootstrapped from the local store or the seed hosts and then
//! refreshed by asking a few snodes for their view of the network, keeping
//! only the nodes they all agree on. Consumers sample it through
//! [`NodePool::get_random`], which spreads picks across `/24` subnets.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use snodekit_shared::constants::{
    CONSENSUS_SAMPLE_SIZE, MIN_POOL_FOR_SWARM_CLEANUP, MIN_SNODE_POOL_COUNT,
    MIN_SNODE_POOL_COUNT_BEFORE_REFRESH_FROM_SNODES, REQUIRED_SNODES_FOR_AGREEMENT,
    REQUIRED_SNODES_FOR_AGREEMENT_DEVNET,
};
use snodekit_shared::Snode;
use snodekit_store::SwarmStore;

use crate::error::PoolError;
use crate::locks::{lock, read, write};
use crate::retry::{retry, Attempt, RetryPolicy};

/// What produced the pool that just replaced the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSource {
    Consensus,
    Seed,
}

/// Told about every wholesale pool replacement, after it is visible.
pub trait PoolRefreshListener: Send + Sync {
    fn on_pool_refreshed(&self, source: RefreshSource);
}

/// Bootstrap list from the seed hosts.
#[async_trait]
pub trait SeedSource: Send + Sync {
    async fn fetch_snode_pool(&self) -> Result<Vec<Snode>, PoolError>;
}

/// One snode's view of the full pool.
#[async_trait]
pub trait ConsensusSource: Send + Sync {
    async fn fetch_pool_from_snode(&self, target: &Snode) -> Result<Vec<Snode>, PoolError>;
}

#[derive(Debug, Clone)]
pub struct NodePoolConfig {
    pub min_pool_count: usize,
    /// Below this size a forced refresh goes to the seeds directly.
    pub min_pool_for_snode_refresh: usize,
    pub required_for_agreement: usize,
    pub consensus_sample: usize,
    pub swarm_cleanup_min_pool: usize,
    pub consensus_retry: RetryPolicy,
}

impl NodePoolConfig {
    pub fn devnet() -> Self {
        Self {
            required_for_agreement: REQUIRED_SNODES_FOR_AGREEMENT_DEVNET,
            ..Self::default()
        }
    }
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            min_pool_count: MIN_SNODE_POOL_COUNT,
            min_pool_for_snode_refresh: MIN_SNODE_POOL_COUNT_BEFORE_REFRESH_FROM_SNODES,
            required_for_agreement: REQUIRED_SNODES_FOR_AGREEMENT,
            consensus_sample: CONSENSUS_SAMPLE_SIZE,
            swarm_cleanup_min_pool: MIN_POOL_FOR_SWARM_CLEANUP,
            consensus_retry: RetryPolicy::new(
                3,
                1,
                Duration::from_secs(1),
                Duration::from_secs(1),
            ),
        }
    }
}

pub struct NodePool {
    config: NodePoolConfig,
    store: Arc<dyn SwarmStore>,
    seed: Arc<dyn SeedSource>,
    consensus: RwLock<Option<Weak<dyn ConsensusSource>>>,
    nodes: RwLock<Vec<Snode>>,
    /// Serialises store and seed fills so concurrent callers share one.
    /// Never held across a request that goes through onion paths.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Held for a whole consensus refresh, only ever taken with `try_lock`.
    consensus_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<Weak<dyn PoolRefreshListener>>>,
}

impl NodePool {
    pub fn new(config: NodePoolConfig, store: Arc<dyn SwarmStore>, seed: Arc<dyn SeedSource>) -> Self {
        Self {
            config,
            store,
            seed,
            consensus: RwLock::new(None),
            nodes: RwLock::new(Vec::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
            consensus_lock: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &NodePoolConfig {
        &self.config
    }

    /// The consensus source talks through onion paths, which are built
    /// from this pool, so it is attached after construction.
    pub fn set_consensus_source(&self, source: Weak<dyn ConsensusSource>) {
        *write(&self.consensus) = Some(source);
    }

    pub fn subscribe(&self, listener: Weak<dyn PoolRefreshListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn snapshot(&self) -> Vec<Snode> {
        read(&self.nodes).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.nodes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pubkey_ed25519: &str) -> bool {
        read(&self.nodes)
            .iter()
            .any(|n| n.pubkey_ed25519 == pubkey_ed25519)
    }

    pub fn find(&self, pubkey_ed25519: &str) -> Option<Snode> {
        read(&self.nodes)
            .iter()
            .find(|n| n.pubkey_ed25519 == pubkey_ed25519)
            .cloned()
    }

    /// A random node outside `exclude` and outside their subnets.
    pub async fn get_random(&self, exclude: &[Snode]) -> Result<Snode, PoolError> {
        self.get_random_with(exclude, |_| true).await
    }

    /// Like [`get_random`](Self::get_random), restricted to nodes passing
    /// `filter`.
    pub async fn get_random_with<F>(&self, exclude: &[Snode], filter: F) -> Result<Snode, PoolError>
    where
        F: Fn(&Snode) -> bool,
    {
        let required = self.config.min_pool_count + exclude.len();
        let pool = self.get_from_cache_or_fetch(exclude.len()).await;
        if pool.len() < required {
            return Err(PoolError::NotEnoughNodes {
                available: pool.len(),
                required,
            });
        }

        pick_weighted(&pool, exclude, filter).ok_or(PoolError::NoCandidates {
            excluded: exclude.len(),
        })
    }

    /// The pool, topped up from the store or the seeds when it holds no
    /// more than `min_pool_count + extra` nodes.
    pub async fn get_from_cache_or_fetch(&self, extra: usize) -> Vec<Snode> {
        let threshold = self.config.min_pool_count + extra;
        if self.len() > threshold {
            return self.snapshot();
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refilled the pool while we waited.
        if self.len() > threshold {
            return self.snapshot();
        }

        match self.store.get_snode_pool().await {
            Ok(stored) => {
                let stored: Vec<Snode> = stored.into_iter().filter(Snode::is_routable).collect();
                if stored.len() > threshold {
                    debug!(count = stored.len(), "loaded snode pool from store");
                    *write(&self.nodes) = stored;
                    return self.snapshot();
                }
            }
            Err(e) => warn!(error = %e, "could not read snode pool from store"),
        }

        self.refresh_from_seed_locked().await
    }

    /// Refresh from snode consensus, falling back to the seeds. Never fails;
    /// returns whatever pool is current afterwards.
    ///
    /// Consensus requests travel over onion paths built from this pool, so
    /// path building may re-enter the pool (and trigger another refresh)
    /// while this runs. A refresh already in flight makes later calls return
    /// the current pool right away.
    pub async fn force_refresh(&self) -> Vec<Snode> {
        let Ok(_refreshing) = self.consensus_lock.try_lock() else {
            debug!("snode pool refresh already running");
            return self.snapshot();
        };

        if self.len() < self.config.min_pool_for_snode_refresh {
            info!(count = self.len(), "pool too small for a consensus refresh, using seeds");
            return self.refresh_from_seed().await;
        }

        match self.refresh_from_network().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "consensus refresh failed, falling back to seeds");
                self.refresh_from_seed().await
            }
        }
    }

    /// Remove one node and persist the pool. Unknown nodes are ignored.
    pub async fn drop_node(&self, pubkey_ed25519: &str) {
        let remaining = {
            let mut nodes = write(&self.nodes);
            let before = nodes.len();
            nodes.retain(|n| n.pubkey_ed25519 != pubkey_ed25519);
            if nodes.len() == before {
                return;
            }
            nodes.clone()
        };

        info!(
            node = %snodekit_shared::short_key(pubkey_ed25519),
            remaining = remaining.len(),
            "dropping snode from pool"
        );
        if let Err(e) = self.store.update_snode_pool(remaining).await {
            warn!(error = %e, "could not persist snode pool after drop");
        }
    }

    /// Ask a sample of snodes for the pool and keep what they agree on.
    /// `refresh_lock` is only taken for the swap.
    async fn refresh_from_network(&self) -> Result<Vec<Snode>, PoolError> {
        let source = read(&self.consensus)
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| PoolError::Consensus("no consensus source attached".to_string()))?;

        let common = retry(&self.config.consensus_retry, "pool consensus", |_| {
            let source = source.clone();
            async move { self.fetch_consensus(source.as_ref()).await.map_err(Attempt::Retry) }
        })
        .await?;

        info!(count = common.len(), "snode pool refreshed from consensus");
        let _guard = self.refresh_lock.lock().await;
        self.replace_pool(common.clone(), RefreshSource::Consensus).await;
        Ok(common)
    }

    async fn fetch_consensus(&self, source: &dyn ConsensusSource) -> Result<Vec<Snode>, PoolError> {
        let targets: Vec<Snode> = {
            let nodes = read(&self.nodes);
            nodes
                .choose_multiple(&mut rand::thread_rng(), self.config.consensus_sample)
                .cloned()
                .collect()
        };
        if targets.len() < self.config.consensus_sample {
            return Err(PoolError::NotEnoughNodes {
                available: targets.len(),
                required: self.config.consensus_sample,
            });
        }

        let views = join_all(targets.iter().map(|t| source.fetch_pool_from_snode(t)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let common = intersect_views(views);
        if common.len() < self.config.required_for_agreement {
            return Err(PoolError::Consensus(format!(
                "only {} nodes in common, need {}",
                common.len(),
                self.config.required_for_agreement
            )));
        }
        Ok(common)
    }

    async fn refresh_from_seed(&self) -> Vec<Snode> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_from_seed_locked().await
    }

    /// Caller holds `refresh_lock`. Seed failures leave the pool untouched.
    async fn refresh_from_seed_locked(&self) -> Vec<Snode> {
        match self.seed.fetch_snode_pool().await {
            Ok(nodes) => {
                let nodes: Vec<Snode> = nodes.into_iter().filter(Snode::is_routable).collect();
                if nodes.is_empty() {
                    warn!("seed returned no usable snodes");
                    return self.snapshot();
                }
                info!(count = nodes.len(), "snode pool refreshed from seed");
                self.replace_pool(nodes.clone(), RefreshSource::Seed).await;
                nodes
            }
            Err(e) => {
                warn!(error = %e, "seed fetch failed, keeping current pool");
                self.snapshot()
            }
        }
    }

    async fn replace_pool(&self, nodes: Vec<Snode>, source: RefreshSource) {
        *write(&self.nodes) = nodes.clone();

        let ids: Vec<String> = nodes.iter().map(|n| n.pubkey_ed25519.clone()).collect();
        if let Err(e) = self.store.update_snode_pool(nodes).await {
            warn!(error = %e, "could not persist snode pool");
        }

        if source == RefreshSource::Consensus && ids.len() > self.config.swarm_cleanup_min_pool {
            match self.store.clear_out_all_snodes_not_in_pool(ids).await {
                Ok(changed) if changed > 0 => debug!(changed, "pruned stale snodes from swarms"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not prune swarms against new pool"),
            }
        }

        self.notify(source);
    }

    fn notify(&self, source: RefreshSource) {
        let listeners: Vec<Arc<dyn PoolRefreshListener>> = {
            let mut listeners = lock(&self.listeners);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_pool_refreshed(source);
        }
    }
}

/// Nodes present in every view, in the order of the first one.
fn intersect_views(views: Vec<Vec<Snode>>) -> Vec<Snode> {
    let mut views = views.into_iter();
    let Some(first) = views.next() else {
        return Vec::new();
    };

    let mut common: HashSet<String> = first.iter().map(|n| n.pubkey_ed25519.clone()).collect();
    for view in views {
        let ids: HashSet<&str> = view.iter().map(|n| n.pubkey_ed25519.as_str()).collect();
        common.retain(|id| ids.contains(id.as_str()));
    }

    first
        .into_iter()
        .filter(|n| n.is_routable() && common.contains(&n.pubkey_ed25519))
        .collect()
}

/// One random representative per subnet, weighted by the subnet's size.
fn pick_weighted<F>(pool: &[Snode], exclude: &[Snode], filter: F) -> Option<Snode>
where
    F: Fn(&Snode) -> bool,
{
    let excluded_ids: HashSet<&str> = exclude.iter().map(|n| n.pubkey_ed25519.as_str()).collect();
    let excluded_subnets: HashSet<&str> = exclude.iter().map(Snode::subnet).collect();

    let mut by_subnet: BTreeMap<&str, Vec<&Snode>> = BTreeMap::new();
    for node in pool {
        if excluded_ids.contains(node.pubkey_ed25519.as_str())
            || excluded_subnets.contains(node.subnet())
            || !filter(node)
        {
            continue;
        }
        by_subnet.entry(node.subnet()).or_default().push(node);
    }

    let mut rng = rand::thread_rng();
    let mut weighted: Vec<&Snode> = Vec::new();
    for group in by_subnet.values() {
        if let Some(representative) = group.choose(&mut rng) {
            weighted.extend(std::iter::repeat(*representative).take(group.len()));
        }
    }

    weighted.choose(&mut rng).map(|n| (*n).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_time::NetworkTime;
    use crate::onion::transport::TransportConfig;
    use crate::snode_api::SnodeApi;
    use crate::testing::{
        node, node_in_subnet, nodes, service_node_states, OnionFixture, Reply, StaticConsensus, StaticSeed,
    };
    use serde_json::json;
    use snodekit_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool_with(seed_nodes: Vec<Snode>) -> (NodePool, Arc<StaticSeed>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let seed = Arc::new(StaticSeed::new(seed_nodes));
        let config = NodePoolConfig {
            consensus_retry: RetryPolicy::immediate(2),
            ..NodePoolConfig::default()
        };
        let pool = NodePool::new(config, store.clone(), seed.clone());
        (pool, seed, store)
    }

    #[derive(Default)]
    struct CountingListener {
        consensus: AtomicUsize,
        seed: AtomicUsize,
    }

    impl PoolRefreshListener for CountingListener {
        fn on_pool_refreshed(&self, source: RefreshSource) {
            match source {
                RefreshSource::Consensus => self.consensus.fetch_add(1, Ordering::SeqCst),
                RefreshSource::Seed => self.seed.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    #[tokio::test]
    async fn test_get_random_always_returns_pool_member() {
        let all = nodes(24);
        let (pool, seed, _) = pool_with(all.clone());

        for _ in 0..1000 {
            let picked = pool.get_random(&[]).await.unwrap();
            assert!(all.contains(&picked));
        }
        // bootstrapped once, then served from memory
        assert_eq!(seed.calls(), 1);
    }

    #[tokio::test]
    async fn test_get_random_honours_exclusion_and_subnets() {
        let mut all = nodes(20);
        let twin = node_in_subnet(&all[0], 99);
        all.push(twin.clone());
        let (pool, _, _) = pool_with(all.clone());

        let exclude = vec![all[0].clone(), all[1].clone()];
        for _ in 0..300 {
            let picked = pool.get_random(&exclude).await.unwrap();
            assert!(!exclude.contains(&picked));
            assert_ne!(picked, twin, "same /24 as an excluded node");
        }
    }

    #[tokio::test]
    async fn test_get_random_fails_below_floor() {
        let (pool, _, _) = pool_with(nodes(10));
        let err = pool.get_random(&[]).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::NotEnoughNodes {
                available: 10,
                required: 12
            }
        ));
    }

    #[tokio::test]
    async fn test_filter_with_no_match_is_no_candidates() {
        let (pool, _, _) = pool_with(nodes(20));
        let err = pool.get_random_with(&[], |_| false).await.unwrap_err();
        assert!(matches!(err, PoolError::NoCandidates { .. }));
    }

    #[tokio::test]
    async fn test_unroutable_nodes_filtered_on_ingest() {
        let mut all = nodes(20);
        all[3].ip = "0.0.0.0".to_string();
        let (pool, _, _) = pool_with(all.clone());

        let fetched = pool.get_from_cache_or_fetch(0).await;
        assert_eq!(fetched.len(), 19);
        assert!(!pool.contains(&all[3].pubkey_ed25519));
    }

    #[tokio::test]
    async fn test_pool_loaded_from_store_before_seed() {
        let (pool, seed, store) = pool_with(nodes(30));
        store.update_snode_pool(nodes(20)).await.unwrap();

        let fetched = pool.get_from_cache_or_fetch(0).await;
        assert_eq!(fetched.len(), 20);
        assert_eq!(seed.calls(), 0);
    }

    #[tokio::test]
    async fn test_drop_is_idempotent_and_persisted() {
        let all = nodes(20);
        let (pool, _, store) = pool_with(all.clone());
        pool.get_from_cache_or_fetch(0).await;

        pool.drop_node(&all[0].pubkey_ed25519).await;
        pool.drop_node(&all[0].pubkey_ed25519).await;
        pool.drop_node("not-a-node").await;

        assert_eq!(pool.len(), 19);
        assert_eq!(store.get_snode_pool().await.unwrap().len(), 19);
    }

    #[tokio::test]
    async fn test_force_refresh_uses_consensus_intersection() {
        let all = nodes(40);
        let (pool, seed, store) = pool_with(all.clone());
        pool.get_from_cache_or_fetch(0).await;

        // every view shares nodes 0..30 and adds its own extras
        let consensus = Arc::new(StaticConsensus::with_views(vec![
            all[..35].to_vec(),
            all[..30].to_vec(),
            [all[..30].to_vec(), vec![node(200)]].concat(),
        ]));
        let source: Arc<dyn ConsensusSource> = consensus.clone();
        pool.set_consensus_source(Arc::downgrade(&source));

        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn PoolRefreshListener> = Arc::downgrade(&(listener.clone() as Arc<dyn PoolRefreshListener>));
        pool.subscribe(weak);

        store
            .update_swarm_nodes_for_pubkey("05aa", vec![all[0].pubkey_ed25519.clone(), all[39].pubkey_ed25519.clone()])
            .await
            .unwrap();

        let refreshed = pool.force_refresh().await;
        assert_eq!(refreshed.len(), 30);
        assert_eq!(pool.len(), 30);
        assert_eq!(seed.calls(), 1);
        assert_eq!(listener.consensus.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get_swarm_nodes_for_pubkey("05aa").await.unwrap(),
            vec![all[0].pubkey_ed25519.clone()]
        );
    }

    #[tokio::test]
    async fn test_force_refresh_falls_back_to_seed() {
        let all = nodes(30);
        let (pool, seed, _) = pool_with(all.clone());
        pool.get_from_cache_or_fetch(0).await;

        // views disagree, no consensus possible
        let consensus = Arc::new(StaticConsensus::with_views(vec![
            all[..10].to_vec(),
            all[10..20].to_vec(),
            all[20..].to_vec(),
        ]));
        let source: Arc<dyn ConsensusSource> = consensus.clone();
        pool.set_consensus_source(Arc::downgrade(&source));

        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn PoolRefreshListener> = Arc::downgrade(&(listener.clone() as Arc<dyn PoolRefreshListener>));
        pool.subscribe(weak);

        let refreshed = pool.force_refresh().await;
        assert_eq!(refreshed.len(), 30);
        assert_eq!(seed.calls(), 2);
        assert_eq!(listener.seed.load(Ordering::SeqCst), 1);
        assert_eq!(listener.consensus.load(Ordering::SeqCst), 0);
        // 3 attempts of 3 sampled nodes each
        assert_eq!(consensus.calls(), 9);
    }

    #[tokio::test]
    async fn test_seed_failure_keeps_previous_pool() {
        let all = nodes(20);
        let (pool, seed, _) = pool_with(all);
        pool.get_from_cache_or_fetch(0).await;

        seed.set_failing(true);
        let refreshed = pool.force_refresh().await;
        assert_eq!(refreshed.len(), 20);
        assert_eq!(pool.len(), 20);
    }

    /// A pool whose consensus source is a real [`SnodeApi`] over onion paths
    /// built from the pool itself.
    fn onion_backed_pool(count: usize) -> (OnionFixture, Arc<SnodeApi>, Arc<CountingListener>) {
        let view = nodes(count);
        let fixture = OnionFixture::build(
            count,
            NodePoolConfig {
                consensus_retry: RetryPolicy::immediate(2),
                ..NodePoolConfig::default()
            },
            TransportConfig {
                retry: RetryPolicy::immediate(2),
                ..TransportConfig::default()
            },
            move |_, _, _| Reply::json(200, json!({ "result": { "service_node_states": service_node_states(&view) } })),
        );
        let api = Arc::new(SnodeApi::new(fixture.transport.clone(), Arc::new(NetworkTime::new())));
        let source: Arc<dyn ConsensusSource> = api.clone();
        fixture.pool.set_consensus_source(Arc::downgrade(&source));

        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn PoolRefreshListener> = Arc::downgrade(&(listener.clone() as Arc<dyn PoolRefreshListener>));
        fixture.pool.subscribe(weak);
        (fixture, api, listener)
    }

    #[tokio::test]
    async fn test_consensus_refresh_through_onion_paths() {
        let (fixture, _api, listener) = onion_backed_pool(24);
        fixture.pool.get_from_cache_or_fetch(0).await;

        let refreshed = tokio::time::timeout(Duration::from_secs(10), fixture.pool.force_refresh())
            .await
            .expect("refresh should not hang");

        assert_eq!(refreshed.len(), 24);
        assert_eq!(listener.consensus.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.paths.paths_snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_survives_path_build_failing_mid_refresh() {
        let (fixture, _api, listener) = onion_backed_pool(24);
        fixture.pool.get_from_cache_or_fetch(0).await;
        // one node passes the guard reachability check, so no path can be
        // built and guard selection keeps sampling the pool mid-refresh
        for n in &nodes(23) {
            fixture.net.set_guard_unreachable(&n.pubkey_ed25519);
        }

        let refreshed = tokio::time::timeout(Duration::from_secs(10), fixture.pool.force_refresh())
            .await
            .expect("refresh should not hang");
        assert_eq!(refreshed.len(), 24);
        assert_eq!(listener.consensus.load(Ordering::SeqCst), 0);
        assert!(listener.seed.load(Ordering::SeqCst) >= 1);

        // the pool stays usable afterwards
        let picked = tokio::time::timeout(Duration::from_secs(1), fixture.pool.get_random(&[]))
            .await
            .expect("pool should not stay locked");
        assert!(picked.is_ok());
    }

    /// Answers every consensus call with `view`, once the gate opens.
    struct GatedConsensus {
        view: Vec<Snode>,
        calls: AtomicUsize,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl ConsensusSource for GatedConsensus {
        async fn fetch_pool_from_snode(&self, _target: &Snode) -> Result<Vec<Snode>, PoolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| PoolError::Consensus(e.to_string()))?;
            Ok(self.view.clone())
        }
    }

    #[tokio::test]
    async fn test_refresh_in_flight_is_not_started_twice() {
        let all = nodes(30);
        let (pool, _, _) = pool_with(all.clone());
        let pool = Arc::new(pool);
        pool.get_from_cache_or_fetch(0).await;

        let consensus = Arc::new(GatedConsensus {
            view: all[..26].to_vec(),
            calls: AtomicUsize::new(0),
            gate: tokio::sync::Semaphore::new(0),
        });
        let source: Arc<dyn ConsensusSource> = consensus.clone();
        pool.set_consensus_source(Arc::downgrade(&source));

        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.force_refresh().await }
        });
        while consensus.calls.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }

        // a second caller gets the current pool without waiting or asking again
        let current = pool.force_refresh().await;
        assert_eq!(current.len(), 30);
        assert_eq!(consensus.calls.load(Ordering::SeqCst), 3);

        consensus.gate.add_permits(3);
        let refreshed = running.await.unwrap();
        assert_eq!(refreshed.len(), 26);
        assert_eq!(pool.len(), 26);
    }

    #[test]
    fn test_intersection_keeps_first_view_order() {
        let all = nodes(5);
        let common = intersect_views(vec![
            all.clone(),
            vec![all[4].clone(), all[1].clone()],
            vec![all[1].clone(), all[4].clone(), all[2].clone()],
        ]);
        assert_eq!(common, vec![all[1].clone(), all[4].clone()]);
    }
}
