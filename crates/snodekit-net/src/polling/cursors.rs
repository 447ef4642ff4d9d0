//! Per (snode, pubkey, namespace) retrieve cursors.
//!
//! The hash of the newest message a snode returned is the `last_hash` of
//! the next retrieve against that snode. Cursors live in memory over the
//! store; missing rows are cached as absent so the store is read once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use snodekit_shared::{short_key, Namespace};
use snodekit_store::{LastHashRecord, StoreError, SwarmStore};

use crate::locks::lock;

type CursorKey = (String, String, Namespace);

pub struct LastHashCursors {
    store: Arc<dyn SwarmStore>,
    /// `None` caches a row the store does not have.
    cache: Mutex<HashMap<CursorKey, Option<String>>>,
}

impl LastHashCursors {
    pub fn new(store: Arc<dyn SwarmStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, snode: &str, pubkey: &str, namespace: Namespace) -> Option<String> {
        let key = (snode.to_string(), pubkey.to_string(), namespace);
        if let Some(cached) = lock(&self.cache).get(&key) {
            return cached.clone();
        }

        let stored = match self
            .store
            .get_last_hash_by_snode(pubkey, snode, namespace.id())
            .await
        {
            Ok(hash) => hash.filter(|h| !h.is_empty()),
            Err(e) => {
                warn!(pubkey = %short_key(pubkey), error = %e, "could not read last hash");
                return None;
            }
        };
        lock(&self.cache).insert(key, stored.clone());
        stored
    }

    /// Move the cursor to `hash`. The store is written first and only when
    /// the hash changed.
    pub async fn update(
        &self,
        snode: &str,
        pubkey: &str,
        namespace: Namespace,
        hash: &str,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let key = (snode.to_string(), pubkey.to_string(), namespace);
        let unchanged = lock(&self.cache)
            .get(&key)
            .is_some_and(|cached| cached.as_deref() == Some(hash));
        if unchanged {
            return Ok(());
        }

        self.store
            .update_last_hash(LastHashRecord {
                snode: snode.to_string(),
                convo_id: pubkey.to_string(),
                namespace: namespace.id(),
                hash: hash.to_string(),
                expires_at,
            })
            .await?;
        lock(&self.cache).insert(key, Some(hash.to_string()));
        Ok(())
    }

    /// Forget every cursor of `pubkey`, in the store and then in memory.
    pub async fn reset(&self, pubkey: &str) -> Result<usize, StoreError> {
        let cleared = self.store.clear_last_hashes_for_convo_id(pubkey).await?;
        lock(&self.cache).retain(|(_, convo, _), _| convo != pubkey);
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snodekit_store::MemoryStore;

    #[tokio::test]
    async fn test_missing_then_updated() {
        let store = Arc::new(MemoryStore::default());
        let cursors = LastHashCursors::new(store.clone());

        assert_eq!(cursors.get("n1", "05aa", Namespace::Default).await, None);
        cursors.update("n1", "05aa", Namespace::Default, "h1", 99).await.unwrap();
        assert_eq!(cursors.get("n1", "05aa", Namespace::Default).await.as_deref(), Some("h1"));

        // persisted, not just cached
        let fresh = LastHashCursors::new(store);
        assert_eq!(fresh.get("n1", "05aa", Namespace::Default).await.as_deref(), Some("h1"));
        assert_eq!(fresh.get("n2", "05aa", Namespace::Default).await, None);
        assert_eq!(fresh.get("n1", "05aa", Namespace::UserProfile).await, None);
    }

    #[tokio::test]
    async fn test_reset_clears_store_and_cache() {
        let store = Arc::new(MemoryStore::default());
        let cursors = LastHashCursors::new(store.clone());
        cursors.update("n1", "05aa", Namespace::Default, "h1", 99).await.unwrap();
        cursors.update("n1", "03bb", Namespace::GroupKeys, "k1", 99).await.unwrap();

        cursors.reset("05aa").await.unwrap();

        assert_eq!(cursors.get("n1", "05aa", Namespace::Default).await, None);
        assert_eq!(cursors.get("n1", "03bb", Namespace::GroupKeys).await.as_deref(), Some("k1"));
        let stored = store.get_last_hash_by_snode("05aa", "n1", 0).await.unwrap();
        assert!(stored.is_none());
    }
}
