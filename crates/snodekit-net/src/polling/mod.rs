//! Periodic retrieval from the swarms of our account and tracked groups.
//!
//! One loop, one cycle every few seconds. Each cycle polls our own swarm
//! plus every tracked group whose cadence says it is due, all in parallel.
//! A group's poll samples a couple of its swarm members, merges what they
//! return by hash and routes the result: configs first, then revocations,
//! then everything else through the receive pipeline.

pub mod cadence;
pub mod cursors;
pub mod hooks;
pub mod merge;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, select_ok};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snodekit_shared::constants::{
    ALREADY_TRACKED_CALLBACK_DELAY_MS, ENVELOPE_DISPATCH_TIMEOUT_MS, FIRST_POLL_DELAY_MS,
    POLL_ACTIVE_INTERVAL_MS, RETRIEVE_SNODES_COUNT,
};
use snodekit_shared::types::{is_group_v2_pubkey, is_standard_pubkey};
use snodekit_shared::{short_key, IdentityKind, Namespace, Snode};
use snodekit_store::{SeenMessageHash, SwarmStore};

use crate::error::{PollError, SnodeApiError, TransportError};
use crate::locks::lock;
use crate::network_time::NetworkTime;
use crate::presence::Presence;
use crate::snode_api::{RetrieveRequest, RetrieveResult, SnodeRetriever};
use crate::swarm::SwarmDirectory;

pub use cadence::{last_poll_timestamp, PollTier};
pub use cursors::LastHashCursors;
pub use hooks::{
    ConfigMerger, DecryptedMessage, GroupMembership, IncomingEnvelope, MembershipSource,
    MessagePipeline, PollerHooks,
};
pub use merge::{categorize, merge_results, Categorized, RetrievedMessage};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub cycle_interval: Duration,
    pub first_poll_delay: Duration,
    /// Swarm members each poll retrieves from.
    pub retrieve_count: usize,
    pub already_tracked_callback_delay: Duration,
    pub dispatch_timeout: Duration,
    /// Pause before merging group configs.
    pub group_config_settle: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_millis(POLL_ACTIVE_INTERVAL_MS as u64),
            first_poll_delay: Duration::from_millis(FIRST_POLL_DELAY_MS),
            retrieve_count: RETRIEVE_SNODES_COUNT,
            already_tracked_callback_delay: Duration::from_millis(ALREADY_TRACKED_CALLBACK_DELAY_MS),
            dispatch_timeout: Duration::from_millis(ENVELOPE_DISPATCH_TIMEOUT_MS),
            group_config_settle: Duration::from_millis(100),
        }
    }
}

/// Networking services the poller reads from.
#[derive(Clone)]
pub struct PollerServices {
    pub swarms: Arc<SwarmDirectory>,
    pub retriever: Arc<dyn SnodeRetriever>,
    pub store: Arc<dyn SwarmStore>,
    pub time: Arc<NetworkTime>,
    pub presence: Arc<Presence>,
}

/// Identities a cycle polls and groups it leaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollingDetails {
    pub to_poll: Vec<(String, IdentityKind)>,
    pub to_leave: Vec<(String, IdentityKind)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedIdentity {
    pub pubkey: String,
    pub kind: IdentityKind,
    pub last_polled_ms: i64,
}

struct Tracked {
    kind: IdentityKind,
    last_polled_ms: i64,
    first_poll: Vec<oneshot::Sender<()>>,
}

/// Handle to the polling loop. Clones share the same state.
#[derive(Clone)]
pub struct SwarmPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    config: PollerConfig,
    own_pubkey: String,
    services: PollerServices,
    hooks: PollerHooks,
    cursors: LastHashCursors,
    tracked: Mutex<HashMap<String, Tracked>>,
    running: Mutex<Option<CancellationToken>>,
}

impl SwarmPoller {
    pub fn new(
        config: PollerConfig,
        own_pubkey: impl Into<String>,
        services: PollerServices,
        hooks: PollerHooks,
    ) -> Self {
        let cursors = LastHashCursors::new(services.store.clone());
        Self {
            inner: Arc::new(PollerInner {
                config,
                own_pubkey: own_pubkey.into(),
                services,
                hooks,
                cursors,
                tracked: Mutex::new(HashMap::new()),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn own_pubkey(&self) -> &str {
        &self.inner.own_pubkey
    }

    /// Start the loop. Calling it again while running does nothing.
    pub fn start(&self) {
        let token = {
            let mut running = lock(&self.inner.running);
            if running.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        info!(pubkey = %short_key(&self.inner.own_pubkey), "starting swarm polling");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(token).await });
    }

    /// Stop the loop and forget every tracked group.
    pub fn stop(&self) {
        if let Some(token) = lock(&self.inner.running).take() {
            token.cancel();
            info!("swarm polling stopped");
        }
        lock(&self.inner.tracked).clear();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Track a `03` or `05` group. Returns `false` for anything else.
    pub fn add_group(&self, pubkey: &str) -> bool {
        self.inner.track(pubkey, None)
    }

    /// Like [`add_group`](Self::add_group); the receiver completes after
    /// the group's first poll, or shortly if it was already tracked.
    pub fn add_group_with_first_poll(&self, pubkey: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.track(pubkey, Some(tx));
        rx
    }

    pub fn remove(&self, pubkey: &str, reason: &str) {
        self.inner.remove(pubkey, reason);
    }

    pub fn tracked(&self) -> Vec<TrackedIdentity> {
        let mut tracked: Vec<TrackedIdentity> = lock(&self.inner.tracked)
            .iter()
            .map(|(pubkey, t)| TrackedIdentity {
                pubkey: pubkey.clone(),
                kind: t.kind,
                last_polled_ms: t.last_polled_ms,
            })
            .collect();
        tracked.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        tracked
    }

    pub fn last_polled_ms(&self, pubkey: &str) -> Option<i64> {
        lock(&self.inner.tracked).get(pubkey).map(|t| t.last_polled_ms)
    }

    pub async fn load_groups_from_membership(&self) {
        self.inner.load_groups_from_membership().await;
    }

    pub async fn get_polling_details(&self) -> PollingDetails {
        self.inner.get_polling_details().await
    }

    pub async fn poll_for_all_keys(&self) {
        self.inner.poll_for_all_keys().await;
    }

    pub async fn poll_once(&self, pubkey: &str, kind: IdentityKind) -> Result<(), PollError> {
        self.inner.poll_once(pubkey, kind).await
    }

    pub async fn reset_last_hashes_for_conversation(&self, pubkey: &str) -> Result<(), PollError> {
        let cleared = self.inner.cursors.reset(pubkey).await?;
        debug!(pubkey = %short_key(pubkey), cleared, "last hashes reset");
        Ok(())
    }

    /// Our user profile config from the first swarm member that has one.
    /// Used before the loop runs, to restore an account.
    pub async fn poll_once_for_own_profile(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedMessage>, PollError> {
        self.inner.poll_once_for_own_profile(cancel).await
    }
}

impl PollerInner {
    async fn run(&self, token: CancellationToken) {
        self.load_groups_from_membership().await;

        let mut delay = self.config.first_poll_delay;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.poll_for_all_keys().await;
            delay = self.config.cycle_interval;
        }
        debug!("swarm polling loop exited");
    }

    fn track(&self, pubkey: &str, first_poll: Option<oneshot::Sender<()>>) -> bool {
        let kind = if is_group_v2_pubkey(pubkey) {
            IdentityKind::GroupV2
        } else if is_standard_pubkey(pubkey) {
            IdentityKind::LegacyGroup
        } else {
            warn!(pubkey = %short_key(pubkey), "not a group pubkey, not polling it");
            return false;
        };

        let mut tracked = lock(&self.tracked);
        if tracked.contains_key(pubkey) {
            if let Some(tx) = first_poll {
                let delay = self.config.already_tracked_callback_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(());
                });
            }
            return true;
        }

        info!(pubkey = %short_key(pubkey), %kind, "tracking swarm");
        tracked.insert(
            pubkey.to_string(),
            Tracked {
                kind,
                last_polled_ms: 0,
                first_poll: first_poll.into_iter().collect(),
            },
        );
        true
    }

    fn remove(&self, pubkey: &str, reason: &str) {
        if lock(&self.tracked).remove(pubkey).is_some() {
            info!(pubkey = %short_key(pubkey), reason, "no longer polling swarm");
        }
    }

    async fn load_groups_from_membership(&self) {
        let membership = &self.hooks.membership;
        match membership.groups().await {
            Ok(groups) => {
                for group in groups.iter().filter(|g| g.pollable) {
                    self.track(&group.pubkey, None);
                }
            }
            Err(e) => warn!(error = %e, "could not list groups to poll"),
        }
        match membership.legacy_groups().await {
            Ok(groups) => {
                for pubkey in &groups {
                    self.track(pubkey, None);
                }
            }
            Err(e) => warn!(error = %e, "could not list legacy groups to poll"),
        }
    }

    async fn get_polling_details(&self) -> PollingDetails {
        let now = self.services.time.now_ms();
        let mut details = PollingDetails {
            to_poll: vec![(self.own_pubkey.clone(), IdentityKind::Private)],
            to_leave: Vec::new(),
        };

        let mut snapshot: Vec<(String, IdentityKind, i64)> = lock(&self.tracked)
            .iter()
            .map(|(pubkey, t)| (pubkey.clone(), t.kind, t.last_polled_ms))
            .collect();
        if snapshot.is_empty() {
            return details;
        }
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));

        let membership = &self.hooks.membership;
        let groups = membership
            .groups()
            .await
            .map_err(|e| warn!(error = %e, "could not read group membership"))
            .ok();
        let legacy = membership
            .legacy_groups()
            .await
            .map_err(|e| warn!(error = %e, "could not read legacy group membership"))
            .ok();

        for (pubkey, kind, last_polled) in snapshot {
            // None: membership unknown this cycle, neither polled nor left.
            let entry: Option<Option<GroupMembership>> = match kind {
                IdentityKind::GroupV2 => groups
                    .as_ref()
                    .map(|groups| groups.iter().find(|g| g.pubkey == pubkey).cloned()),
                IdentityKind::LegacyGroup => legacy.as_ref().map(|legacy| {
                    legacy.contains(&pubkey).then(|| GroupMembership {
                        pubkey: pubkey.clone(),
                        invite_pending: false,
                        pollable: true,
                    })
                }),
                IdentityKind::Private => None,
            };

            match entry {
                None => {}
                Some(None) => details.to_leave.push((pubkey, kind)),
                Some(Some(group)) if group.invite_pending => {}
                Some(Some(_)) => {
                    let tier = PollTier::for_activity(membership.last_active_ms(&pubkey).await, now);
                    if tier.is_due(last_polled, now) {
                        details.to_poll.push((pubkey, kind));
                    }
                }
            }
        }
        details
    }

    async fn poll_for_all_keys(&self) {
        if !self.services.presence.is_online() {
            debug!("offline, skipping poll cycle");
            return;
        }

        let details = self.get_polling_details().await;
        for (pubkey, kind) in &details.to_leave {
            self.leave(pubkey, *kind, "not in the membership wrapper").await;
        }

        let polls = details.to_poll.iter().map(|(pubkey, kind)| async move {
            if let Err(e) = self.poll_once(pubkey, *kind).await {
                warn!(pubkey = %short_key(pubkey), %kind, error = %e, "poll failed");
            }
        });
        join_all(polls).await;
    }

    async fn poll_once(&self, pubkey: &str, kind: IdentityKind) -> Result<(), PollError> {
        let swarm = self.services.swarms.get_swarm(pubkey).await;
        let targets: Vec<Snode> = swarm
            .choose_multiple(&mut rand::thread_rng(), self.config.retrieve_count)
            .cloned()
            .collect();
        if targets.len() < self.config.retrieve_count {
            return Err(PollError::NotEnoughSwarmNodes {
                pubkey: pubkey.to_string(),
                found: targets.len(),
            });
        }

        let namespaces = Namespace::polled_for(kind);
        let per_node: Vec<Vec<RetrieveResult>> = join_all(
            targets
                .iter()
                .map(|target| self.poll_node_for_key(target, pubkey, kind, &namespaces)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let merged = merge_results(per_node);
        if merged.is_empty() {
            self.update_last_poll_timestamp(pubkey, kind, 0);
            self.fire_first_poll(pubkey);
            return Ok(());
        }

        let Categorized {
            configs,
            revoked,
            others,
        } = categorize(merged);
        debug!(
            pubkey = %short_key(pubkey),
            configs = configs.len(),
            revoked = revoked.len(),
            others = others.len(),
            "retrieved"
        );

        if !configs.is_empty() {
            self.merge_configs(pubkey, kind, &configs).await;
        }
        if kind == IdentityKind::GroupV2 && !revoked.is_empty() {
            if let Err(e) = self.hooks.pipeline.handle_revoked(pubkey, &revoked).await {
                warn!(pubkey = %short_key(pubkey), error = %e, "could not handle revoked messages");
            }
        }

        self.update_last_poll_timestamp(pubkey, kind, others.len());

        if kind.is_group() && !self.still_member(pubkey, kind).await {
            self.leave(pubkey, kind, "left while being polled").await;
            return Ok(());
        }

        let fresh = self.drop_seen(others).await?;
        match kind {
            IdentityKind::GroupV2 => {
                if self.hooks.pipeline.has_group_keys(pubkey).await {
                    self.decrypt_and_dispatch(pubkey, kind, &fresh).await?;
                } else {
                    debug!(pubkey = %short_key(pubkey), "no keys for group yet");
                }
            }
            IdentityKind::Private | IdentityKind::LegacyGroup => {
                self.decrypt_and_dispatch(pubkey, kind, &fresh).await?;
            }
        }
        self.fire_first_poll(pubkey);
        Ok(())
    }

    /// Config hashes whose expiry rides along with a poll of `pubkey`. Only
    /// our own account and v2 groups keep configs in their swarm.
    async fn config_hashes_to_bump(&self, pubkey: &str, kind: IdentityKind) -> Vec<String> {
        let owned = match kind {
            IdentityKind::Private => pubkey == self.own_pubkey,
            IdentityKind::GroupV2 => true,
            IdentityKind::LegacyGroup => false,
        };
        if !owned {
            return Vec::new();
        }
        match self.hooks.configs.active_hashes(kind, pubkey).await {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!(pubkey = %short_key(pubkey), error = %e, "could not read active config hashes");
                Vec::new()
            }
        }
    }

    /// Retrieve every namespace of `pubkey` from one node and move its
    /// cursors. `None` when the node could not be polled.
    async fn poll_node_for_key(
        &self,
        node: &Snode,
        pubkey: &str,
        kind: IdentityKind,
        namespaces: &[Namespace],
    ) -> Option<Vec<RetrieveResult>> {
        let snode = node.pubkey_ed25519.as_str();
        let before = self.cursor_hashes(snode, pubkey, namespaces).await;
        let requests: Vec<RetrieveRequest> = namespaces
            .iter()
            .zip(&before)
            .map(|(namespace, last_hash)| RetrieveRequest {
                namespace: *namespace,
                last_hash: last_hash.clone(),
            })
            .collect();

        let bump = self.config_hashes_to_bump(pubkey, kind).await;
        let results = match self
            .services
            .retriever
            .retrieve(node, pubkey, &requests, &bump, self.hooks.auth.as_ref())
            .await
        {
            Ok(results) => results,
            Err(e) => {
                self.handle_retrieve_error(node, pubkey, e).await;
                return None;
            }
        };

        let after = self.cursor_hashes(snode, pubkey, namespaces).await;
        if before.iter().any(Option::is_some) && after.iter().all(Option::is_none) {
            info!(
                pubkey = %short_key(pubkey),
                node = %node.short(),
                "cursors were reset during the retrieve, discarding its results"
            );
            return Some(Vec::new());
        }

        if kind == IdentityKind::GroupV2 {
            self.check_group_expiry(pubkey, namespaces, &before, &results).await;
        }

        for result in &results {
            let Some(newest) = result.messages.last() else {
                continue;
            };
            if let Err(e) = self
                .cursors
                .update(snode, pubkey, result.namespace, &newest.hash, newest.expiration)
                .await
            {
                warn!(pubkey = %short_key(pubkey), namespace = %result.namespace, error = %e, "could not save last hash");
            }
        }
        Some(results)
    }

    async fn cursor_hashes(&self, snode: &str, pubkey: &str, namespaces: &[Namespace]) -> Vec<Option<String>> {
        let mut hashes = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            hashes.push(self.cursors.get(snode, pubkey, *namespace).await);
        }
        hashes
    }

    async fn handle_retrieve_error(&self, node: &Snode, pubkey: &str, error: SnodeApiError) {
        let swarms = &self.services.swarms;
        match error {
            SnodeApiError::WrongSwarm { snode, replacement } => {
                if replacement.is_empty() {
                    info!(pubkey = %short_key(pubkey), node = %short_key(&snode), "snode left the swarm");
                    swarms.drop_node_if_present(pubkey, &snode).await;
                } else {
                    info!(pubkey = %short_key(pubkey), size = replacement.len(), "snode suggested a new swarm");
                    swarms.update(pubkey, &replacement).await;
                }
            }
            SnodeApiError::Transport(TransportError::DestinationUnreachable(snode)) => {
                swarms.drop_node_if_present(pubkey, &snode).await;
            }
            other => {
                warn!(pubkey = %short_key(pubkey), node = %node.short(), error = %other, "retrieve failed");
            }
        }
    }

    /// A group with no config anywhere is either destroyed or polled from a
    /// lagging node. Only the former marks it expired.
    async fn check_group_expiry(
        &self,
        pubkey: &str,
        namespaces: &[Namespace],
        before: &[Option<String>],
        results: &[RetrieveResult],
    ) {
        let no_config_before = namespaces
            .iter()
            .zip(before)
            .filter(|(namespace, _)| namespace.is_group_config())
            .all(|(_, hash)| hash.is_none());
        let no_config_after = results
            .iter()
            .filter(|r| r.namespace.is_group_config())
            .all(|r| r.messages.is_empty());

        let membership = &self.hooks.membership;
        if no_config_before && no_config_after {
            if self.swarm_knows_group_keys(pubkey).await {
                debug!(pubkey = %short_key(pubkey), "empty config from one snode, the swarm has keys");
                return;
            }
            if !membership.is_group_expired(pubkey).await {
                info!(pubkey = %short_key(pubkey), "no snode has config for the group, marking it expired");
                if let Err(e) = membership.set_group_expired(pubkey, true).await {
                    warn!(pubkey = %short_key(pubkey), error = %e, "could not mark group expired");
                }
            }
        } else if membership.is_group_expired(pubkey).await {
            info!(pubkey = %short_key(pubkey), "group has config again, no longer expired");
            if let Err(e) = membership.set_group_expired(pubkey, false).await {
                warn!(pubkey = %short_key(pubkey), error = %e, "could not clear group expiry");
            }
        }
    }

    async fn swarm_knows_group_keys(&self, pubkey: &str) -> bool {
        let swarm = self.services.swarms.get_swarm(pubkey).await;
        for node in &swarm {
            if self
                .cursors
                .get(&node.pubkey_ed25519, pubkey, Namespace::GroupKeys)
                .await
                .is_some()
            {
                return true;
            }
        }
        false
    }

    async fn merge_configs(&self, pubkey: &str, kind: IdentityKind, configs: &[RetrievedMessage]) {
        let merger = &self.hooks.configs;
        let result = match kind {
            IdentityKind::Private => merger.merge_user_configs(configs).await,
            IdentityKind::GroupV2 => {
                tokio::time::sleep(self.config.group_config_settle).await;
                merger.merge_group_configs(pubkey, configs).await
            }
            IdentityKind::LegacyGroup => return,
        };
        if let Err(e) = result {
            warn!(pubkey = %short_key(pubkey), %kind, error = %e, "config merge failed");
        }
    }

    async fn still_member(&self, pubkey: &str, kind: IdentityKind) -> bool {
        let membership = &self.hooks.membership;
        let found = match kind {
            IdentityKind::GroupV2 => membership
                .groups()
                .await
                .map(|groups| groups.iter().any(|g| g.pubkey == pubkey)),
            IdentityKind::LegacyGroup => membership
                .legacy_groups()
                .await
                .map(|groups| groups.iter().any(|g| g == pubkey)),
            IdentityKind::Private => return true,
        };
        found.unwrap_or_else(|e| {
            warn!(pubkey = %short_key(pubkey), error = %e, "could not check membership, keeping group");
            true
        })
    }

    async fn leave(&self, pubkey: &str, kind: IdentityKind, reason: &str) {
        if let Err(e) = self.hooks.membership.leave_group(pubkey, kind, reason).await {
            warn!(pubkey = %short_key(pubkey), error = %e, "could not leave group");
        }
        self.remove(pubkey, reason);
    }

    async fn drop_seen(&self, messages: Vec<RetrievedMessage>) -> Result<Vec<RetrievedMessage>, PollError> {
        if messages.is_empty() {
            return Ok(messages);
        }
        let hashes = messages.iter().map(|m| m.hash.clone()).collect();
        let seen = self.services.store.get_seen_messages_by_hash_list(hashes).await?;
        Ok(messages
            .into_iter()
            .filter(|m| !seen.contains(&m.hash))
            .collect())
    }

    /// Dispatch one envelope per decrypted message. Each is marked seen
    /// once its dispatch finished, failed or timed out.
    async fn decrypt_and_dispatch(
        &self,
        pubkey: &str,
        kind: IdentityKind,
        messages: &[RetrievedMessage],
    ) -> Result<(), PollError> {
        if messages.is_empty() {
            return Ok(());
        }
        let pipeline = &self.hooks.pipeline;
        let decrypted = pipeline.decrypt(kind, pubkey, messages).await?;
        let conversation_id = if kind.is_group() {
            pubkey
        } else {
            self.own_pubkey.as_str()
        };

        for message in decrypted {
            let Some(expiration) = messages
                .iter()
                .find(|m| m.hash == message.hash)
                .map(|m| m.expiration)
            else {
                warn!(hash = %message.hash, "decrypted message matches nothing retrieved");
                continue;
            };
            let hash = message.hash.clone();
            let envelope = IncomingEnvelope::new(kind, pubkey, message, expiration, self.services.time.now_ms());

            match tokio::time::timeout(self.config.dispatch_timeout, pipeline.dispatch(envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%hash, error = %e, "envelope dispatch failed"),
                Err(_) => warn!(%hash, "envelope dispatch timed out"),
            }

            let seen = SeenMessageHash {
                hash,
                conversation_id: conversation_id.to_string(),
                expires_at: expiration,
            };
            if let Err(e) = self.services.store.save_seen_message_hashes(vec![seen]).await {
                warn!(error = %e, "could not save seen message hash");
            }
        }
        Ok(())
    }

    fn update_last_poll_timestamp(&self, pubkey: &str, kind: IdentityKind, message_count: usize) {
        if !kind.is_group() {
            return;
        }
        let timestamp = last_poll_timestamp(self.services.time.now_ms(), message_count);
        if let Some(entry) = lock(&self.tracked).get_mut(pubkey) {
            entry.last_polled_ms = timestamp;
        }
    }

    fn fire_first_poll(&self, pubkey: &str) {
        let senders = match lock(&self.tracked).get_mut(pubkey) {
            Some(entry) => std::mem::take(&mut entry.first_poll),
            None => return,
        };
        for tx in senders {
            let _ = tx.send(());
        }
    }

    async fn poll_once_for_own_profile(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedMessage>, PollError> {
        if cancel.is_cancelled() {
            return Err(PollError::Aborted);
        }
        let pubkey = self.own_pubkey.as_str();
        let swarm = self.services.swarms.get_swarm(pubkey).await;
        if swarm.is_empty() {
            return Err(PollError::NotEnoughSwarmNodes {
                pubkey: pubkey.to_string(),
                found: 0,
            });
        }

        // Lagging snodes answer with nothing, so take the first non-empty.
        let attempts = swarm
            .iter()
            .map(|node| Box::pin(self.own_profile_from(node, pubkey)));

        tokio::select! {
            _ = cancel.cancelled() => Err(PollError::Aborted),
            found = select_ok(attempts) => found.map(|(messages, _)| messages),
        }
    }

    async fn own_profile_from(&self, node: &Snode, pubkey: &str) -> Result<Vec<RetrievedMessage>, PollError> {
        let requests = [RetrieveRequest {
            namespace: Namespace::UserProfile,
            last_hash: None,
        }];
        let results = self
            .services
            .retriever
            .retrieve(node, pubkey, &requests, &[], self.hooks.auth.as_ref())
            .await?;
        let messages = merge_results(vec![results]);
        if messages.is_empty() {
            return Err(PollError::NoProfileConfig);
        }
        info!(node = %node.short(), count = messages.len(), "found user profile config");
        Ok(messages)
    }
}
