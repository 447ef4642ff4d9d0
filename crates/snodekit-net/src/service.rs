//! Wires the pool, paths, transport, swarm directory and poller together.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use snodekit_store::SwarmStore;

use crate::link::SnodeLink;
use crate::network_time::NetworkTime;
use crate::node_pool::{ConsensusSource, NodePool, NodePoolConfig, PoolRefreshListener, SeedSource};
use crate::onion::paths::{OnionPathBuilder, PathConfig, PathStatus};
use crate::onion::transport::{OnionRequestTransport, TransportConfig};
use crate::polling::{PollerConfig, PollerHooks, PollerServices, SwarmPoller, TrackedIdentity};
use crate::presence::Presence;
use crate::seed::SeedNodeClient;
use crate::snode_api::SnodeApi;
use crate::swarm::{SwarmDirectory, SwarmDirectoryConfig};

#[derive(Clone, Default)]
pub struct NetworkConfig {
    pub pool: NodePoolConfig,
    /// Empty means the built-in seed hosts.
    pub seed_urls: Vec<String>,
    pub paths: PathConfig,
    pub transport: TransportConfig,
    pub swarms: SwarmDirectoryConfig,
    pub poller: PollerConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub online: bool,
    pub pool_size: usize,
    pub path_status: PathStatus,
    /// ed25519 keys of every hop, guard first.
    pub paths: Vec<Vec<String>>,
    pub time_offset_ms: i64,
    pub polling: bool,
    pub tracked: Vec<TrackedIdentity>,
}

/// Expired rows removed by [`SnodeNetwork::cleanup_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub seen_messages: usize,
    pub last_hashes: usize,
}

pub struct SnodeNetwork {
    store: Arc<dyn SwarmStore>,
    pool: Arc<NodePool>,
    paths: Arc<OnionPathBuilder>,
    transport: Arc<OnionRequestTransport>,
    time: Arc<NetworkTime>,
    api: Arc<SnodeApi>,
    swarms: Arc<SwarmDirectory>,
    poller: SwarmPoller,
}

impl SnodeNetwork {
    /// Bootstraps from the configured seed hosts over `link`.
    pub fn new(
        config: NetworkConfig,
        store: Arc<dyn SwarmStore>,
        link: Arc<dyn SnodeLink>,
        own_pubkey: impl Into<String>,
        hooks: PollerHooks,
    ) -> Self {
        let seed = Arc::new(SeedNodeClient::new(link.clone(), config.seed_urls.clone()));
        Self::with_seed(config, store, link, seed, own_pubkey, hooks)
    }

    pub fn with_seed(
        config: NetworkConfig,
        store: Arc<dyn SwarmStore>,
        link: Arc<dyn SnodeLink>,
        seed: Arc<dyn SeedSource>,
        own_pubkey: impl Into<String>,
        hooks: PollerHooks,
    ) -> Self {
        let pool = Arc::new(NodePool::new(config.pool, store.clone(), seed));
        let paths = Arc::new(OnionPathBuilder::new(
            config.paths,
            pool.clone(),
            store.clone(),
            link.clone(),
        ));
        let presence = Arc::new(Presence::new());
        let transport = Arc::new(OnionRequestTransport::new(
            config.transport,
            paths.clone(),
            pool.clone(),
            link,
            presence.clone(),
        ));
        let time = Arc::new(NetworkTime::new());
        let api = Arc::new(SnodeApi::new(transport.clone(), time.clone()));
        let swarms = Arc::new(SwarmDirectory::new(
            config.swarms,
            pool.clone(),
            store.clone(),
            api.clone(),
        ));

        let consensus: Arc<dyn ConsensusSource> = api.clone();
        pool.set_consensus_source(Arc::downgrade(&consensus));
        let listeners: [Arc<dyn PoolRefreshListener>; 3] =
            [paths.clone(), transport.clone(), swarms.clone()];
        for listener in &listeners {
            pool.subscribe(Arc::downgrade(listener));
        }

        let poller = SwarmPoller::new(
            config.poller,
            own_pubkey,
            PollerServices {
                swarms: swarms.clone(),
                retriever: api.clone(),
                store: store.clone(),
                time: time.clone(),
                presence,
            },
            hooks,
        );

        Self {
            store,
            pool,
            paths,
            transport,
            time,
            api,
            swarms,
            poller,
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn paths(&self) -> &Arc<OnionPathBuilder> {
        &self.paths
    }

    pub fn transport(&self) -> &Arc<OnionRequestTransport> {
        &self.transport
    }

    pub fn presence(&self) -> &Arc<Presence> {
        self.transport.presence()
    }

    pub fn time(&self) -> &Arc<NetworkTime> {
        &self.time
    }

    pub fn api(&self) -> &Arc<SnodeApi> {
        &self.api
    }

    pub fn swarms(&self) -> &Arc<SwarmDirectory> {
        &self.swarms
    }

    pub fn poller(&self) -> &SwarmPoller {
        &self.poller
    }

    /// Fill the pool and start polling.
    pub async fn start(&self) {
        let pool = self.pool.get_from_cache_or_fetch(0).await;
        info!(pool = pool.len(), "snode network started");
        self.poller.start();
    }

    pub fn stop(&self) {
        self.poller.stop();
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            online: self.presence().is_online(),
            pool_size: self.pool.len(),
            path_status: self.paths.status(),
            paths: self
                .paths
                .paths_snapshot()
                .iter()
                .map(|path| path.iter().map(|n| n.pubkey_ed25519.clone()).collect())
                .collect(),
            time_offset_ms: self.time.offset_ms(),
            polling: self.poller.is_running(),
            tracked: self.poller.tracked(),
        }
    }

    /// Drop expired seen hashes and retrieve cursors.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        let now = self.time.now_ms();
        let mut report = CleanupReport::default();
        match self.store.clean_seen_messages(now).await {
            Ok(count) => report.seen_messages = count,
            Err(e) => warn!(error = %e, "could not clean seen messages"),
        }
        match self.store.clean_expired_last_hashes(now).await {
            Ok(count) => report.last_hashes = count,
            Err(e) => warn!(error = %e, "could not clean last hashes"),
        }
        report
    }
}

impl Drop for SnodeNetwork {
    fn drop(&mut self) {
        self.poller.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polling::{
        ConfigMerger, DecryptedMessage, GroupMembership, IncomingEnvelope, MembershipSource,
        MessagePipeline, RetrievedMessage,
    };
    use crate::onion::envelope::V4RequestInfo;
    use crate::retry::RetryPolicy;
    use crate::snode_api::RetrieveAuth;
    use crate::testing::{node, nodes, service_node_states, FakeNetwork, Reply, StaticSeed};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use snodekit_shared::{IdentityKind, Namespace, Snode};
    use snodekit_store::{MemoryStore, SeenMessageHash};

    struct Quiet;

    #[async_trait]
    impl MembershipSource for Quiet {
        async fn groups(&self) -> anyhow::Result<Vec<GroupMembership>> {
            Ok(Vec::new())
        }
        async fn legacy_groups(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn last_active_ms(&self, _: &str) -> Option<i64> {
            None
        }
        async fn leave_group(&self, _: &str, _: IdentityKind, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn is_group_expired(&self, _: &str) -> bool {
            false
        }
        async fn set_group_expired(&self, _: &str, _: bool) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ConfigMerger for Quiet {
        async fn merge_user_configs(&self, _: &[RetrievedMessage]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn merge_group_configs(&self, _: &str, _: &[RetrievedMessage]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn active_hashes(&self, _: IdentityKind, _: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl MessagePipeline for Quiet {
        async fn has_group_keys(&self, _: &str) -> bool {
            false
        }
        async fn decrypt(&self, _: IdentityKind, _: &str, _: &[RetrievedMessage]) -> anyhow::Result<Vec<DecryptedMessage>> {
            Ok(Vec::new())
        }
        async fn handle_revoked(&self, _: &str, _: &[RetrievedMessage]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn dispatch(&self, _: IncomingEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl RetrieveAuth for Quiet {
        async fn retrieve_params(&self, _: &str, _: Namespace, _: i64) -> anyhow::Result<Option<Map<String, Value>>> {
            Ok(None)
        }
    }

    fn network(store: Arc<MemoryStore>) -> SnodeNetwork {
        let all = nodes(30);
        let link = Arc::new(FakeNetwork::new(
            &all,
            Arc::new(|_: &Snode, _: &V4RequestInfo, body: Option<&[u8]>| {
                let body: Value = serde_json::from_slice(body.unwrap_or_default()).unwrap();
                if body["method"] == "oxend_request" {
                    let states = service_node_states(&nodes(30));
                    return Reply::json(200, json!({ "result": { "service_node_states": states } }));
                }
                assert_eq!(body["method"], "get_swarm");
                let snodes: Vec<Value> = (1..4)
                    .map(|i| {
                        let n = node(i);
                        json!({
                            "ip": n.ip,
                            "port_https": n.port,
                            "pubkey_ed25519": n.pubkey_ed25519,
                            "pubkey_x25519": n.pubkey_x25519,
                        })
                    })
                    .collect();
                Reply::json(200, json!({ "snodes": snodes }))
            }),
        ));
        let quiet = Arc::new(Quiet);
        let config = NetworkConfig {
            transport: TransportConfig {
                retry: RetryPolicy::immediate(2),
                ..TransportConfig::default()
            },
            ..NetworkConfig::default()
        };
        SnodeNetwork::with_seed(
            config,
            store,
            link,
            Arc::new(StaticSeed::new(all)),
            format!("05{}", "1".repeat(64)),
            PollerHooks {
                membership: quiet.clone(),
                configs: quiet.clone(),
                pipeline: quiet.clone(),
                auth: quiet,
            },
        )
    }

    #[tokio::test]
    async fn test_swarm_lookup_goes_through_onion_paths() {
        let store = Arc::new(MemoryStore::default());
        let network = network(store.clone());

        let swarm = network.swarms().get_swarm("05aa").await;
        assert_eq!(swarm.len(), 3);
        assert!(swarm.contains(&node(2)));
        assert_eq!(store.get_swarm_nodes_for_pubkey("05aa").await.unwrap().len(), 3);

        let status = network.status();
        assert!(status.online);
        assert_eq!(status.pool_size, 30);
        assert!(!status.paths.is_empty());
        assert!(!status.polling);
    }

    #[tokio::test]
    async fn test_consensus_refresh_reaches_wired_services() {
        let network = network(Arc::new(MemoryStore::default()));
        network.swarms().get_swarm("05aa").await;
        assert_eq!(network.swarms().cached_size("05aa"), Some(3));

        let refreshed = network.pool().force_refresh().await;
        assert_eq!(refreshed.len(), 30);
        // only a consensus refresh clears the swarm cache
        assert_eq!(network.swarms().cached_size("05aa"), None);
    }

    #[tokio::test]
    async fn test_cleanup_drops_only_expired_rows() {
        let store = Arc::new(MemoryStore::default());
        let network = network(store.clone());
        store
            .save_seen_message_hashes(vec![
                SeenMessageHash {
                    hash: "old".to_string(),
                    conversation_id: "05aa".to_string(),
                    expires_at: 1,
                },
                SeenMessageHash {
                    hash: "new".to_string(),
                    conversation_id: "05aa".to_string(),
                    expires_at: i64::MAX,
                },
            ])
            .await
            .unwrap();

        let report = network.cleanup_expired().await;
        assert_eq!(report.seen_messages, 1);
        let left = store
            .get_seen_messages_by_hash_list(vec!["old".to_string(), "new".to_string()])
            .await
            .unwrap();
        assert_eq!(left, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_start_and_stop_polling() {
        let network = network(Arc::new(MemoryStore::default()));
        network.start().await;
        assert!(network.status().polling);
        network.stop();
        assert!(!network.status().polling);
    }
}
