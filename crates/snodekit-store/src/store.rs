//! Async storage seam used by the networking services.
//!
//! The services never touch a [`Database`] directly. They talk to a
//! [`SwarmStore`], which is backed either by SQLite (blocking calls moved to
//! the blocking pool) or by plain maps for tests and ephemeral runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use snodekit_shared::Snode;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{LastHashRecord, SeenMessageHash};

#[async_trait]
pub trait SwarmStore: Send + Sync {
    async fn get_snode_pool(&self) -> Result<Vec<Snode>>;
    async fn update_snode_pool(&self, nodes: Vec<Snode>) -> Result<()>;

    async fn get_swarm_nodes_for_pubkey(&self, pubkey: &str) -> Result<Vec<String>>;
    async fn update_swarm_nodes_for_pubkey(&self, pubkey: &str, nodes: Vec<String>) -> Result<()>;
    async fn clear_out_all_snodes_not_in_pool(&self, pool: Vec<String>) -> Result<usize>;

    async fn get_last_hash_by_snode(
        &self,
        convo_id: &str,
        snode: &str,
        namespace: i16,
    ) -> Result<Option<String>>;
    async fn update_last_hash(&self, record: LastHashRecord) -> Result<()>;
    async fn clear_last_hashes_for_convo_id(&self, convo_id: &str) -> Result<usize>;
    async fn clean_expired_last_hashes(&self, now_ms: i64) -> Result<usize>;

    async fn get_seen_messages_by_hash_list(&self, hashes: Vec<String>) -> Result<Vec<String>>;
    async fn save_seen_message_hashes(&self, items: Vec<SeenMessageHash>) -> Result<()>;
    async fn clean_seen_messages(&self, now_ms: i64) -> Result<usize>;

    async fn get_guard_nodes(&self) -> Result<Vec<String>>;
    async fn update_guard_nodes(&self, guards: Vec<String>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// [`SwarmStore`] over a shared [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SwarmStore for SqliteStore {
    async fn get_snode_pool(&self) -> Result<Vec<Snode>> {
        self.with_db(|db| db.get_snode_pool()).await
    }

    async fn update_snode_pool(&self, nodes: Vec<Snode>) -> Result<()> {
        self.with_db(move |db| db.update_snode_pool(&nodes)).await
    }

    async fn get_swarm_nodes_for_pubkey(&self, pubkey: &str) -> Result<Vec<String>> {
        let pubkey = pubkey.to_string();
        self.with_db(move |db| db.get_swarm_nodes_for_pubkey(&pubkey))
            .await
    }

    async fn update_swarm_nodes_for_pubkey(&self, pubkey: &str, nodes: Vec<String>) -> Result<()> {
        let pubkey = pubkey.to_string();
        self.with_db(move |db| db.update_swarm_nodes_for_pubkey(&pubkey, &nodes))
            .await
    }

    async fn clear_out_all_snodes_not_in_pool(&self, pool: Vec<String>) -> Result<usize> {
        self.with_db(move |db| db.clear_out_all_snodes_not_in_pool(&pool))
            .await
    }

    async fn get_last_hash_by_snode(
        &self,
        convo_id: &str,
        snode: &str,
        namespace: i16,
    ) -> Result<Option<String>> {
        let (convo_id, snode) = (convo_id.to_string(), snode.to_string());
        self.with_db(move |db| db.get_last_hash_by_snode(&convo_id, &snode, namespace))
            .await
    }

    async fn update_last_hash(&self, record: LastHashRecord) -> Result<()> {
        self.with_db(move |db| db.update_last_hash(&record)).await
    }

    async fn clear_last_hashes_for_convo_id(&self, convo_id: &str) -> Result<usize> {
        let convo_id = convo_id.to_string();
        self.with_db(move |db| db.clear_last_hashes_for_convo_id(&convo_id))
            .await
    }

    async fn clean_expired_last_hashes(&self, now_ms: i64) -> Result<usize> {
        self.with_db(move |db| db.clean_expired_last_hashes(now_ms))
            .await
    }

    async fn get_seen_messages_by_hash_list(&self, hashes: Vec<String>) -> Result<Vec<String>> {
        self.with_db(move |db| db.get_seen_messages_by_hash_list(&hashes))
            .await
    }

    async fn save_seen_message_hashes(&self, items: Vec<SeenMessageHash>) -> Result<()> {
        self.with_db(move |db| db.save_seen_message_hashes(&items))
            .await
    }

    async fn clean_seen_messages(&self, now_ms: i64) -> Result<usize> {
        self.with_db(move |db| db.clean_seen_messages(now_ms)).await
    }

    async fn get_guard_nodes(&self) -> Result<Vec<String>> {
        self.with_db(|db| db.get_guard_nodes()).await
    }

    async fn update_guard_nodes(&self, guards: Vec<String>) -> Result<()> {
        self.with_db(move |db| db.update_guard_nodes(&guards)).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    pool: Vec<Snode>,
    swarms: HashMap<String, Vec<String>>,
    last_hashes: HashMap<(String, String, i16), LastHashRecord>,
    seen: HashMap<String, SeenMessageHash>,
    guards: Vec<String>,
}

/// [`SwarmStore`] kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SwarmStore for MemoryStore {
    async fn get_snode_pool(&self) -> Result<Vec<Snode>> {
        Ok(self.state.read().await.pool.clone())
    }

    async fn update_snode_pool(&self, nodes: Vec<Snode>) -> Result<()> {
        self.state.write().await.pool = nodes;
        Ok(())
    }

    async fn get_swarm_nodes_for_pubkey(&self, pubkey: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .await
            .swarms
            .get(pubkey)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_swarm_nodes_for_pubkey(&self, pubkey: &str, nodes: Vec<String>) -> Result<()> {
        self.state
            .write()
            .await
            .swarms
            .insert(pubkey.to_string(), nodes);
        Ok(())
    }

    async fn clear_out_all_snodes_not_in_pool(&self, pool: Vec<String>) -> Result<usize> {
        let pool: HashSet<String> = pool.into_iter().collect();
        let mut state = self.state.write().await;
        let mut changed = 0;
        for nodes in state.swarms.values_mut() {
            let before = nodes.len();
            nodes.retain(|n| pool.contains(n));
            if nodes.len() != before {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_last_hash_by_snode(
        &self,
        convo_id: &str,
        snode: &str,
        namespace: i16,
    ) -> Result<Option<String>> {
        let key = (snode.to_string(), convo_id.to_string(), namespace);
        Ok(self
            .state
            .read()
            .await
            .last_hashes
            .get(&key)
            .map(|r| r.hash.clone()))
    }

    async fn update_last_hash(&self, record: LastHashRecord) -> Result<()> {
        let key = (record.snode.clone(), record.convo_id.clone(), record.namespace);
        self.state.write().await.last_hashes.insert(key, record);
        Ok(())
    }

    async fn clear_last_hashes_for_convo_id(&self, convo_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.last_hashes.len();
        state.last_hashes.retain(|(_, convo, _), _| convo != convo_id);
        Ok(before - state.last_hashes.len())
    }

    async fn clean_expired_last_hashes(&self, now_ms: i64) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.last_hashes.len();
        state.last_hashes.retain(|_, r| r.expires_at > now_ms);
        Ok(before - state.last_hashes.len())
    }

    async fn get_seen_messages_by_hash_list(&self, hashes: Vec<String>) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(hashes
            .into_iter()
            .filter(|h| state.seen.contains_key(h))
            .collect())
    }

    async fn save_seen_message_hashes(&self, items: Vec<SeenMessageHash>) -> Result<()> {
        let mut state = self.state.write().await;
        for item in items {
            state.seen.insert(item.hash.clone(), item);
        }
        Ok(())
    }

    async fn clean_seen_messages(&self, now_ms: i64) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.seen.len();
        state.seen.retain(|_, s| s.expires_at > now_ms);
        Ok(before - state.seen.len())
    }

    async fn get_guard_nodes(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.guards.clone())
    }

    async fn update_guard_nodes(&self, guards: Vec<String>) -> Result<()> {
        self.state.write().await.guards = guards;
        Ok(())
    }
}
