//! Onion path construction and repair.
//!
//! A small set of paths is kept, each starting at a guard node drawn from
//! a persisted guard set. No two nodes of a path share a `/24`, and paths
//! avoid each other's nodes while the pool is large enough. A failing hop
//! is replaced in place; a failing guard takes its whole path down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use snodekit_shared::constants::{
    MIN_EDGE_STORAGE_SERVER_VERSION, ONION_PATH_COUNT, ONION_PATH_LENGTH, PATH_FAILURE_THRESHOLD,
};
use snodekit_shared::{short_key, Snode};
use snodekit_store::SwarmStore;

use crate::error::{PathError, PoolError};
use crate::link::SnodeLink;
use crate::locks::lock;
use crate::node_pool::{NodePool, PoolRefreshListener, RefreshSource};

#[derive(Debug, Clone)]
pub struct PathConfig {
    pub path_count: usize,
    pub path_length: usize,
    pub failure_threshold: u32,
    /// Minimum storage server version of the exit hop.
    pub min_edge_version: Vec<u16>,
    pub guard_probe_timeout: Duration,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            path_count: ONION_PATH_COUNT,
            path_length: ONION_PATH_LENGTH,
            failure_threshold: PATH_FAILURE_THRESHOLD,
            min_edge_version: MIN_EDGE_STORAGE_SERVER_VERSION.to_vec(),
            guard_probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Unbuilt,
    Building,
    Ready,
    /// Fewer paths than wanted until the next build.
    Degraded,
}

struct PathState {
    paths: Vec<Vec<Snode>>,
    guards: Vec<Snode>,
    /// Keyed by guard ed25519.
    failures: HashMap<String, u32>,
    status: PathStatus,
}

pub struct OnionPathBuilder {
    config: PathConfig,
    pool: Arc<NodePool>,
    store: Arc<dyn SwarmStore>,
    link: Arc<dyn SnodeLink>,
    state: Mutex<PathState>,
    build_lock: tokio::sync::Mutex<()>,
}

impl OnionPathBuilder {
    pub fn new(
        config: PathConfig,
        pool: Arc<NodePool>,
        store: Arc<dyn SwarmStore>,
        link: Arc<dyn SnodeLink>,
    ) -> Self {
        Self {
            config,
            pool,
            store,
            link,
            state: Mutex::new(PathState {
                paths: Vec::new(),
                guards: Vec::new(),
                failures: HashMap::new(),
                status: PathStatus::Unbuilt,
            }),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> PathStatus {
        lock(&self.state).status
    }

    pub fn paths_snapshot(&self) -> Vec<Vec<Snode>> {
        lock(&self.state).paths.clone()
    }

    pub fn guards_snapshot(&self) -> Vec<Snode> {
        lock(&self.state).guards.clone()
    }

    /// A random ready path sharing no node with `exclude`, building paths
    /// first when fewer than wanted exist.
    pub async fn get_path(&self, exclude: &[Snode]) -> Result<Vec<Snode>, PathError> {
        if lock(&self.state).paths.len() < self.config.path_count {
            self.build_paths().await?;
        }

        let state = lock(&self.state);
        let usable: Vec<&Vec<Snode>> = state
            .paths
            .iter()
            .filter(|path| !path.iter().any(|n| exclude.contains(n)))
            .collect();
        usable
            .choose(&mut rand::thread_rng())
            .map(|path| (*path).clone())
            .ok_or(PathError::NoUsablePath)
    }

    async fn build_paths(&self) -> Result<(), PathError> {
        let _guard = self.build_lock.lock().await;
        {
            let mut state = lock(&self.state);
            if state.paths.len() >= self.config.path_count {
                return Ok(());
            }
            if state.status == PathStatus::Unbuilt {
                state.status = PathStatus::Building;
            }
        }

        let result = self.build_missing_paths().await;

        let mut state = lock(&self.state);
        state.status = if state.paths.len() >= self.config.path_count {
            PathStatus::Ready
        } else if state.paths.is_empty() && result.is_err() {
            PathStatus::Unbuilt
        } else {
            PathStatus::Degraded
        };
        result
    }

    async fn build_missing_paths(&self) -> Result<(), PathError> {
        let guards = self.select_guards().await?;

        for guard in guards {
            let (has_path, in_use) = {
                let state = lock(&self.state);
                let has_path = state.paths.iter().any(|p| p.first() == Some(&guard));
                let in_use: Vec<Snode> = state
                    .paths
                    .iter()
                    .flatten()
                    .chain(state.guards.iter())
                    .cloned()
                    .collect();
                (has_path, in_use)
            };
            if has_path {
                continue;
            }

            let path = self.build_path_from(guard, &in_use).await?;
            info!(
                path = %path.iter().map(Snode::short).collect::<Vec<_>>().join(" -> "),
                "built onion path"
            );
            lock(&self.state).paths.push(path);
        }
        Ok(())
    }

    /// Extend `guard` to a full path, avoiding `in_use` where the pool allows.
    async fn build_path_from(&self, guard: Snode, in_use: &[Snode]) -> Result<Vec<Snode>, PathError> {
        let mut path = vec![guard];
        while path.len() < self.config.path_length {
            let is_exit = path.len() + 1 == self.config.path_length;
            let wide: Vec<Snode> = in_use.iter().chain(path.iter()).cloned().collect();
            let next = match self.pick_hop(&wide, is_exit).await {
                Ok(node) => node,
                // not enough nodes to keep paths disjoint, settle for the
                // subnet rule within this path
                Err(PoolError::NoCandidates { .. }) | Err(PoolError::NotEnoughNodes { .. }) => {
                    self.pick_hop(&path, is_exit).await?
                }
                Err(e) => return Err(e.into()),
            };
            path.push(next);
        }
        Ok(path)
    }

    async fn pick_hop(&self, exclude: &[Snode], is_exit: bool) -> Result<Snode, PoolError> {
        if is_exit {
            let min_version = &self.config.min_edge_version;
            self.pool
                .get_random_with(exclude, |n| n.meets_version(min_version))
                .await
        } else {
            self.pool.get_random(exclude).await
        }
    }

    /// Current guards, topped up to `path_count` with probed pool nodes and
    /// persisted when changed.
    async fn select_guards(&self) -> Result<Vec<Snode>, PathError> {
        let wanted = self.config.path_count;
        // populate the pool before resolving guard keys against it
        self.pool.get_from_cache_or_fetch(0).await;

        let mut guards: Vec<Snode> = lock(&self.state)
            .guards
            .iter()
            .filter(|g| self.pool.contains(&g.pubkey_ed25519))
            .cloned()
            .collect();
        let mut changed = false;

        if guards.is_empty() {
            match self.store.get_guard_nodes().await {
                Ok(stored) => {
                    for ed in &stored {
                        let Some(node) = self.pool.find(ed) else { continue };
                        if guards.iter().all(|g| g.subnet() != node.subnet()) {
                            guards.push(node);
                        }
                    }
                    guards.truncate(wanted);
                    debug!(count = guards.len(), "loaded guard nodes from store");
                    // rewrite only when some stored guard was unusable
                    changed = guards.len() != stored.len();
                }
                Err(e) => {
                    warn!(error = %e, "could not read guard nodes");
                    changed = true;
                }
            }
        }
        guards.truncate(wanted);

        let in_use: Vec<Snode> = self.paths_snapshot().into_iter().flatten().collect();
        let mut rejected: Vec<Snode> = Vec::new();
        while guards.len() < wanted {
            let exclude: Vec<Snode> = guards
                .iter()
                .chain(rejected.iter())
                .chain(in_use.iter())
                .cloned()
                .collect();
            let candidate = match self.pool.get_random(&exclude).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(error = %e, found = guards.len(), "ran out of guard candidates");
                    return Err(PathError::NotEnoughGuards {
                        found: guards.len(),
                        required: wanted,
                    });
                }
            };

            match self.link.probe(&candidate, self.config.guard_probe_timeout).await {
                Ok(()) => {
                    debug!(guard = %candidate.short(), "guard candidate reachable");
                    guards.push(candidate);
                    changed = true;
                }
                Err(e) => {
                    debug!(guard = %candidate.short(), error = %e, "guard candidate rejected");
                    rejected.push(candidate);
                }
            }
        }

        lock(&self.state).guards = guards.clone();
        if changed {
            self.persist_guards(&guards).await;
        }
        Ok(guards)
    }

    async fn persist_guards(&self, guards: &[Snode]) {
        let ids = guards.iter().map(|g| g.pubkey_ed25519.clone()).collect();
        if let Err(e) = self.store.update_guard_nodes(ids).await {
            warn!(error = %e, "could not persist guard nodes");
        }
    }

    /// Replace `pubkey_ed25519` in whichever path holds it. A guard takes
    /// its path down with it. Unknown nodes are ignored.
    pub async fn drop_node_from_path(&self, pubkey_ed25519: &str, reason: &str) {
        let located = {
            let state = lock(&self.state);
            state.paths.iter().find_map(|path| {
                path.iter()
                    .position(|n| n.pubkey_ed25519 == pubkey_ed25519)
                    .map(|position| (path[0].clone(), position, path.clone()))
            })
        };
        let Some((guard, position, path)) = located else {
            debug!(node = %short_key(pubkey_ed25519), "node not in any path, nothing to drop");
            return;
        };

        info!(node = %short_key(pubkey_ed25519), position, reason, "dropping node from onion path");

        if position == 0 {
            self.drop_guard(&guard).await;
            return;
        }

        let is_exit = position + 1 == path.len();
        let in_use: Vec<Snode> = self.paths_snapshot().into_iter().flatten().collect();
        let replacement = match self.pick_hop(&in_use, is_exit).await {
            Ok(node) => Ok(node),
            Err(_) => self.pick_hop(&path, is_exit).await,
        };

        let mut state = lock(&self.state);
        let Some(index) = state.paths.iter().position(|p| p.first() == Some(&guard)) else {
            return;
        };

        match replacement {
            Ok(node) => {
                // the path may have been patched while we were picking
                if let Some(slot) = state.paths[index]
                    .get_mut(position)
                    .filter(|n| n.pubkey_ed25519 == pubkey_ed25519)
                {
                    debug!(replacement = %node.short(), "patched onion path");
                    *slot = node;
                }
            }
            Err(e) => {
                warn!(error = %e, "no replacement hop, dropping the whole path");
                state.paths.remove(index);
                state.status = PathStatus::Degraded;
            }
        }
    }

    async fn drop_guard(&self, guard: &Snode) {
        let guards = {
            let mut state = lock(&self.state);
            state.paths.retain(|p| p.first() != Some(guard));
            state.guards.retain(|g| g != guard);
            state.failures.remove(&guard.pubkey_ed25519);
            state.status = PathStatus::Degraded;
            state.guards.clone()
        };
        self.persist_guards(&guards).await;
    }

    /// Count a failure of the path starting at `guard`; at the threshold
    /// the path and its guard are discarded.
    pub async fn increment_path_failure(&self, guard: &Snode) {
        let failures = {
            let mut state = lock(&self.state);
            if !state.paths.iter().any(|p| p.first() == Some(guard)) {
                return;
            }
            let count = state.failures.entry(guard.pubkey_ed25519.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.config.failure_threshold {
            warn!(guard = %guard.short(), failures, "onion path failed too often, dropping it");
            self.drop_guard(guard).await;
        } else {
            debug!(guard = %guard.short(), failures, "onion path failure");
        }
    }

    pub fn reset_failure_counters(&self) {
        lock(&self.state).failures.clear();
    }
}

impl PoolRefreshListener for OnionPathBuilder {
    fn on_pool_refreshed(&self, _source: RefreshSource) {
        self.reset_failure_counters();
    }
}
