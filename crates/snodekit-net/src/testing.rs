//! In-process fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use x25519_dalek::{PublicKey, StaticSecret};

use snodekit_shared::constants::NEXT_NODE_NOT_FOUND_PREFIX;
use snodekit_shared::crypto::encrypt;
use snodekit_shared::Snode;
use snodekit_store::{LastHashRecord, MemoryStore, SeenMessageHash, StoreError, SwarmStore};

use crate::error::{LinkError, PoolError};
use crate::link::SnodeLink;
use crate::node_pool::{ConsensusSource, NodePool, NodePoolConfig, SeedSource};
use crate::onion::envelope::{
    decode_v4_request, encode_v4_response, peel_layer, Destination, NextHop, V4RequestInfo,
};
use crate::onion::paths::{OnionPathBuilder, PathConfig};
use crate::onion::transport::{OnionRequestTransport, TransportConfig};
use crate::presence::Presence;
use crate::retry::RetryPolicy;

type StoreResult<T> = Result<T, StoreError>;

/// Deterministic x25519 secret of test node `i`.
pub fn secret(i: usize) -> StaticSecret {
    let mut bytes = [7u8; 32];
    bytes[..8].copy_from_slice(&(i as u64).to_le_bytes());
    StaticSecret::from(bytes)
}

pub fn ed_key(i: usize) -> String {
    format!("{i:064x}")
}

/// Test node `i`, alone in its own `/24`.
pub fn node(i: usize) -> Snode {
    Snode {
        ip: format!("10.{}.{}.1", (i / 256) % 256, i % 256),
        port: 22021,
        pubkey_x25519: hex::encode(PublicKey::from(&secret(i)).to_bytes()),
        pubkey_ed25519: ed_key(i),
        storage_server_version: vec![2, 8, 0],
    }
}

pub fn nodes(count: usize) -> Vec<Snode> {
    (0..count).map(node).collect()
}

/// Node `id` placed in the same `/24` as `base`.
pub fn node_in_subnet(base: &Snode, id: usize) -> Snode {
    Snode {
        ip: format!("{}.{}", base.subnet(), 2 + id % 250),
        ..node(id)
    }
}

/// Index of a node built by [`node`], recovered from its ed25519 key.
pub fn index_of(pubkey_ed25519: &str) -> Option<usize> {
    usize::from_str_radix(pubkey_ed25519, 16).ok()
}

pub struct StaticSeed {
    nodes: Mutex<Vec<Snode>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticSeed {
    pub fn new(nodes: Vec<Snode>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SeedSource for StaticSeed {
    async fn fetch_snode_pool(&self) -> Result<Vec<Snode>, PoolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PoolError::Seed("seed offline".to_string()));
        }
        Ok(self.nodes.lock().unwrap().clone())
    }
}

/// Hands out the configured views round robin, one per call.
pub struct StaticConsensus {
    views: Vec<Vec<Snode>>,
    calls: AtomicUsize,
}

impl StaticConsensus {
    pub fn with_views(views: Vec<Vec<Snode>>) -> Self {
        Self {
            views,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsensusSource for StaticConsensus {
    async fn fetch_pool_from_snode(&self, _target: &Snode) -> Result<Vec<Snode>, PoolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.views[call % self.views.len()].clone())
    }
}

/// What a fake destination answers.
pub struct Reply {
    pub code: u16,
    pub json: bool,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(code: u16, body: Value) -> Self {
        Self {
            code,
            json: true,
            body: body.to_string().into_bytes(),
        }
    }

    pub fn text(code: u16, body: &str) -> Self {
        Self {
            code,
            json: false,
            body: body.as_bytes().to_vec(),
        }
    }
}

pub type Responder = Arc<dyn Fn(&Snode, &V4RequestInfo, Option<&[u8]>) -> Reply + Send + Sync>;

/// A network of [`node`]s that opens every onion layer with the hop's real
/// key and answers at the destination through `responder`.
pub struct FakeNetwork {
    nodes: HashMap<String, Snode>,
    responder: Responder,
    sends: AtomicUsize,
    offline: AtomicBool,
    guard_status: Mutex<Option<u16>>,
    unreachable: Mutex<HashSet<String>>,
    unreachable_guards: Mutex<HashSet<String>>,
    last_route: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn new(nodes: &[Snode], responder: Responder) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| (n.pubkey_ed25519.clone(), n.clone()))
                .collect(),
            responder,
            sends: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            guard_status: Mutex::new(None),
            unreachable: Mutex::new(HashSet::new()),
            unreachable_guards: Mutex::new(HashSet::new()),
            last_route: Mutex::new(Vec::new()),
        }
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_guard_status(&self, status: Option<u16>) {
        *self.guard_status.lock().unwrap() = status;
    }

    pub fn set_unreachable(&self, pubkey_ed25519: &str) {
        self.unreachable
            .lock()
            .unwrap()
            .insert(pubkey_ed25519.to_string());
    }

    /// `node` fails the guard reachability check but still relays.
    pub fn set_guard_unreachable(&self, pubkey_ed25519: &str) {
        self.unreachable_guards
            .lock()
            .unwrap()
            .insert(pubkey_ed25519.to_string());
    }

    /// ed25519 keys of every node the last request visited, guard first.
    pub fn last_route(&self) -> Vec<String> {
        self.last_route.lock().unwrap().clone()
    }

    fn deliver(&self, guard: &Snode, payload: Vec<u8>) -> Result<Vec<u8>, LinkError> {
        let mut current = guard.clone();
        let mut blob = payload;
        let mut route = Vec::new();

        loop {
            route.push(current.pubkey_ed25519.clone());
            *self.last_route.lock().unwrap() = route.clone();

            let index = index_of(&current.pubkey_ed25519)
                .ok_or_else(|| LinkError::Http("unknown hop".to_string()))?;
            let peeled = peel_layer(&secret(index), &blob)
                .map_err(|e| LinkError::Http(format!("hop could not peel: {e}")))?;

            match peeled.next {
                NextHop::Relay { ref destination } => {
                    let next = self.nodes.get(destination).cloned();
                    let reachable = !self.unreachable.lock().unwrap().contains(destination);
                    let Some(next) = next.filter(|_| reachable) else {
                        return Err(LinkError::Status {
                            code: 502,
                            body: format!("{NEXT_NODE_NOT_FOUND_PREFIX}{destination}"),
                        });
                    };
                    blob = peeled.forward_blob().map_err(|e| LinkError::Http(e.to_string()))?;
                    current = next;
                }
                NextHop::Destination => {
                    let (info, body) =
                        decode_v4_request(&peeled.inner).map_err(|e| LinkError::Http(e.to_string()))?;
                    let reply = (self.responder)(&current, &info, body.as_deref());
                    let headers = if reply.json {
                        BTreeMap::from([("content-type".to_string(), "application/json".to_string())])
                    } else {
                        BTreeMap::new()
                    };
                    let response = encode_v4_response(reply.code, &headers, Some(&reply.body))
                        .map_err(|e| LinkError::Http(e.to_string()))?;
                    return encrypt(&peeled.key, &response).map_err(|e| LinkError::Http(e.to_string()));
                }
                NextHop::Server { .. } => {
                    return Err(LinkError::Http("no servers in the fake network".to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl SnodeLink for FakeNetwork {
    async fn send_onion(
        &self,
        guard: &Snode,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(LinkError::Connect("network unreachable".to_string()));
        }
        if let Some(code) = *self.guard_status.lock().unwrap() {
            return Err(LinkError::Status {
                code,
                body: String::new(),
            });
        }
        self.deliver(guard, payload)
    }

    async fn probe(&self, node: &Snode, _timeout: Duration) -> Result<(), LinkError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(LinkError::Connect("network unreachable".to_string()))
        } else if self.unreachable_guards.lock().unwrap().contains(&node.pubkey_ed25519) {
            Err(LinkError::Connect("refused".to_string()))
        } else {
            Ok(())
        }
    }

    async fn post_seed(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<Vec<u8>, LinkError> {
        Err(LinkError::Connect("no seeds in the fake network".to_string()))
    }
}

/// A transport over a [`FakeNetwork`], 30 nodes unless built otherwise.
pub struct OnionFixture {
    pub net: Arc<FakeNetwork>,
    pub pool: Arc<NodePool>,
    pub seed: Arc<StaticSeed>,
    pub store: Arc<MemoryStore>,
    pub paths: Arc<OnionPathBuilder>,
    pub transport: Arc<OnionRequestTransport>,
}

impl OnionFixture {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Snode, &V4RequestInfo, Option<&[u8]>) -> Reply + Send + Sync + 'static,
    {
        Self::with_config(
            TransportConfig {
                retry: RetryPolicy::immediate(2),
                ..TransportConfig::default()
            },
            responder,
        )
    }

    pub fn with_config<F>(config: TransportConfig, responder: F) -> Self
    where
        F: Fn(&Snode, &V4RequestInfo, Option<&[u8]>) -> Reply + Send + Sync + 'static,
    {
        Self::build(30, NodePoolConfig::default(), config, responder)
    }

    pub fn build<F>(
        count: usize,
        pool_config: NodePoolConfig,
        config: TransportConfig,
        responder: F,
    ) -> Self
    where
        F: Fn(&Snode, &V4RequestInfo, Option<&[u8]>) -> Reply + Send + Sync + 'static,
    {
        let all = nodes(count);
        let store = Arc::new(MemoryStore::default());
        let net = Arc::new(FakeNetwork::new(&all, Arc::new(responder)));
        let seed = Arc::new(StaticSeed::new(all));
        let pool = Arc::new(NodePool::new(pool_config, store.clone(), seed.clone()));
        let paths = Arc::new(OnionPathBuilder::new(
            PathConfig::default(),
            pool.clone(),
            store.clone(),
            net.clone(),
        ));
        let transport = Arc::new(OnionRequestTransport::new(
            config,
            paths.clone(),
            pool.clone(),
            net.clone(),
            Arc::new(Presence::new()),
        ));
        Self {
            net,
            pool,
            seed,
            store,
            paths,
            transport,
        }
    }

    pub fn destination(&self, i: usize) -> Destination {
        Destination::Snode(node(i))
    }
}

/// `service_node_states` entries as an `oxend_request` result lists them.
pub fn service_node_states(nodes: &[Snode]) -> Value {
    nodes
        .iter()
        .map(|n| {
            json!({
                "public_ip": n.ip,
                "storage_port": n.port,
                "pubkey_x25519": n.pubkey_x25519,
                "pubkey_ed25519": n.pubkey_ed25519,
                "storage_server_version": n.storage_server_version,
            })
        })
        .collect()
}

/// [`MemoryStore`] that counts guard set writes.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    guard_writes: AtomicUsize,
}

impl CountingStore {
    pub fn guard_writes(&self) -> usize {
        self.guard_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmStore for CountingStore {
    async fn get_snode_pool(&self) -> StoreResult<Vec<Snode>> {
        self.inner.get_snode_pool().await
    }

    async fn update_snode_pool(&self, nodes: Vec<Snode>) -> StoreResult<()> {
        self.inner.update_snode_pool(nodes).await
    }

    async fn get_swarm_nodes_for_pubkey(&self, pubkey: &str) -> StoreResult<Vec<String>> {
        self.inner.get_swarm_nodes_for_pubkey(pubkey).await
    }

    async fn update_swarm_nodes_for_pubkey(&self, pubkey: &str, nodes: Vec<String>) -> StoreResult<()> {
        self.inner.update_swarm_nodes_for_pubkey(pubkey, nodes).await
    }

    async fn clear_out_all_snodes_not_in_pool(&self, pool: Vec<String>) -> StoreResult<usize> {
        self.inner.clear_out_all_snodes_not_in_pool(pool).await
    }

    async fn get_last_hash_by_snode(
        &self,
        convo_id: &str,
        snode: &str,
        namespace: i16,
    ) -> StoreResult<Option<String>> {
        self.inner.get_last_hash_by_snode(convo_id, snode, namespace).await
    }

    async fn update_last_hash(&self, record: LastHashRecord) -> StoreResult<()> {
        self.inner.update_last_hash(record).await
    }

    async fn clear_last_hashes_for_convo_id(&self, convo_id: &str) -> StoreResult<usize> {
        self.inner.clear_last_hashes_for_convo_id(convo_id).await
    }

    async fn clean_expired_last_hashes(&self, now_ms: i64) -> StoreResult<usize> {
        self.inner.clean_expired_last_hashes(now_ms).await
    }

    async fn get_seen_messages_by_hash_list(&self, hashes: Vec<String>) -> StoreResult<Vec<String>> {
        self.inner.get_seen_messages_by_hash_list(hashes).await
    }

    async fn save_seen_message_hashes(&self, items: Vec<SeenMessageHash>) -> StoreResult<()> {
        self.inner.save_seen_message_hashes(items).await
    }

    async fn clean_seen_messages(&self, now_ms: i64) -> StoreResult<usize> {
        self.inner.clean_seen_messages(now_ms).await
    }

    async fn get_guard_nodes(&self) -> StoreResult<Vec<String>> {
        self.inner.get_guard_nodes().await
    }

    async fn update_guard_nodes(&self, guards: Vec<String>) -> StoreResult<()> {
        self.guard_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_guard_nodes(guards).await
    }
}
