//! Poller hooks for a headless daemon.
//!
//! There is no conversation state here. Groups come from the configuration,
//! envelopes are only logged and stored payloads are passed on undecrypted.
//! Configs are logged too, and the newest hash per config namespace is kept
//! so their expiry keeps being extended.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use snodekit_net::polling::{
    ConfigMerger, DecryptedMessage, GroupMembership, IncomingEnvelope, MembershipSource,
    MessagePipeline, RetrievedMessage,
};
use snodekit_shared::{short_key, IdentityKind, Namespace};

pub struct LoggingHooks {
    groups: Vec<String>,
    legacy_groups: Vec<String>,
    left: Mutex<HashSet<String>>,
    expired: Mutex<HashSet<String>>,
    last_seen: Mutex<HashMap<String, i64>>,
    /// Newest config hash per namespace, keyed by swarm pubkey. Our own
    /// configs live under the empty key.
    config_hashes: Mutex<HashMap<String, HashMap<Namespace, String>>>,
}

impl LoggingHooks {
    pub fn new(groups: Vec<String>, legacy_groups: Vec<String>) -> Self {
        Self {
            groups,
            legacy_groups,
            left: Mutex::new(HashSet::new()),
            expired: Mutex::new(HashSet::new()),
            last_seen: Mutex::new(HashMap::new()),
            config_hashes: Mutex::new(HashMap::new()),
        }
    }

    fn remember_configs(&self, owner: &str, messages: &[RetrievedMessage]) -> anyhow::Result<()> {
        let mut configs = self
            .config_hashes
            .lock()
            .map_err(|_| anyhow::anyhow!("config state poisoned"))?;
        let latest = configs.entry(owner.to_string()).or_default();
        for message in messages {
            latest.insert(message.namespace, message.hash.clone());
        }
        Ok(())
    }

    fn has_left(&self, pubkey: &str) -> bool {
        self.left
            .lock()
            .map(|left| left.contains(pubkey))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MembershipSource for LoggingHooks {
    async fn groups(&self) -> anyhow::Result<Vec<GroupMembership>> {
        Ok(self
            .groups
            .iter()
            .filter(|pubkey| !self.has_left(pubkey))
            .map(|pubkey| GroupMembership {
                pubkey: pubkey.clone(),
                invite_pending: false,
                pollable: true,
            })
            .collect())
    }

    async fn legacy_groups(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .legacy_groups
            .iter()
            .filter(|pubkey| !self.has_left(pubkey))
            .cloned()
            .collect())
    }

    /// Newest message dispatched for the conversation.
    async fn last_active_ms(&self, pubkey: &str) -> Option<i64> {
        self.last_seen.lock().ok()?.get(pubkey).copied()
    }

    async fn leave_group(&self, pubkey: &str, kind: IdentityKind, reason: &str) -> anyhow::Result<()> {
        info!(pubkey = %short_key(pubkey), %kind, reason, "Leaving group");
        self.left
            .lock()
            .map_err(|_| anyhow::anyhow!("membership state poisoned"))?
            .insert(pubkey.to_string());
        Ok(())
    }

    async fn is_group_expired(&self, pubkey: &str) -> bool {
        self.expired
            .lock()
            .map(|expired| expired.contains(pubkey))
            .unwrap_or(false)
    }

    async fn set_group_expired(&self, pubkey: &str, expired: bool) -> anyhow::Result<()> {
        info!(pubkey = %short_key(pubkey), expired, "Group expiry changed");
        let mut set = self
            .expired
            .lock()
            .map_err(|_| anyhow::anyhow!("membership state poisoned"))?;
        if expired {
            set.insert(pubkey.to_string());
        } else {
            set.remove(pubkey);
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigMerger for LoggingHooks {
    async fn merge_user_configs(&self, messages: &[RetrievedMessage]) -> anyhow::Result<()> {
        info!(count = messages.len(), "User config messages received");
        self.remember_configs("", messages)
    }

    async fn merge_group_configs(&self, group_pubkey: &str, messages: &[RetrievedMessage]) -> anyhow::Result<()> {
        info!(group = %short_key(group_pubkey), count = messages.len(), "Group config messages received");
        self.remember_configs(group_pubkey, messages)
    }

    async fn active_hashes(&self, kind: IdentityKind, pubkey: &str) -> anyhow::Result<Vec<String>> {
        let owner = match kind {
            IdentityKind::Private => "",
            IdentityKind::GroupV2 => pubkey,
            IdentityKind::LegacyGroup => return Ok(Vec::new()),
        };
        let configs = self
            .config_hashes
            .lock()
            .map_err(|_| anyhow::anyhow!("config state poisoned"))?;
        let mut hashes: Vec<String> = configs
            .get(owner)
            .map(|latest| latest.values().cloned().collect())
            .unwrap_or_default();
        hashes.sort();
        Ok(hashes)
    }
}

#[async_trait]
impl MessagePipeline for LoggingHooks {
    async fn has_group_keys(&self, _group_pubkey: &str) -> bool {
        true
    }

    async fn decrypt(
        &self,
        _kind: IdentityKind,
        pubkey: &str,
        messages: &[RetrievedMessage],
    ) -> anyhow::Result<Vec<DecryptedMessage>> {
        Ok(messages
            .iter()
            .filter_map(|m| {
                let plaintext = m.payload().ok()?;
                Some(DecryptedMessage {
                    hash: m.hash.clone(),
                    sender: pubkey.to_string(),
                    plaintext,
                    sent_at_ms: m.stored_at,
                })
            })
            .collect())
    }

    async fn handle_revoked(&self, group_pubkey: &str, messages: &[RetrievedMessage]) -> anyhow::Result<()> {
        info!(group = %short_key(group_pubkey), count = messages.len(), "Revocation messages received");
        Ok(())
    }

    async fn dispatch(&self, envelope: IncomingEnvelope) -> anyhow::Result<()> {
        debug!(
            source = %short_key(&envelope.source),
            kind = %envelope.kind,
            hash = %envelope.message_hash,
            bytes = envelope.content.len(),
            "Envelope received"
        );
        if let Ok(mut last_seen) = self.last_seen.lock() {
            let entry = last_seen.entry(envelope.source.clone()).or_insert(0);
            *entry = (*entry).max(envelope.sent_at_ms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hooks() -> LoggingHooks {
        LoggingHooks::new(vec!["03aa".to_string()], vec!["05bb".to_string()])
    }

    #[tokio::test]
    async fn test_left_groups_disappear_from_membership() {
        let hooks = hooks();
        assert_eq!(hooks.groups().await.unwrap().len(), 1);

        hooks.leave_group("03aa", IdentityKind::GroupV2, "test").await.unwrap();
        hooks.leave_group("05bb", IdentityKind::LegacyGroup, "test").await.unwrap();

        assert!(hooks.groups().await.unwrap().is_empty());
        assert!(hooks.legacy_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_flag_round_trip() {
        let hooks = hooks();
        hooks.set_group_expired("03aa", true).await.unwrap();
        assert!(hooks.is_group_expired("03aa").await);
        hooks.set_group_expired("03aa", false).await.unwrap();
        assert!(!hooks.is_group_expired("03aa").await);
    }

    #[tokio::test]
    async fn test_dispatch_records_activity() {
        let hooks = hooks();
        let message = RetrievedMessage {
            namespace: Namespace::GroupMessages,
            hash: "h".to_string(),
            data: "aGk=".to_string(),
            expiration: 10,
            stored_at: 7,
        };
        let decrypted = hooks
            .decrypt(IdentityKind::GroupV2, "03aa", std::slice::from_ref(&message))
            .await
            .unwrap();
        assert_eq!(decrypted[0].plaintext, b"hi");

        let envelope = IncomingEnvelope::new(IdentityKind::GroupV2, "03aa", decrypted[0].clone(), 10, 8);
        hooks.dispatch(envelope).await.unwrap();
        assert_eq!(hooks.last_active_ms("03aa").await, Some(7));
    }

    fn config(namespace: Namespace, hash: &str) -> RetrievedMessage {
        RetrievedMessage {
            namespace,
            hash: hash.to_string(),
            data: "aGk=".to_string(),
            expiration: 10,
            stored_at: 7,
        }
    }

    #[tokio::test]
    async fn test_active_hashes_track_newest_config_per_namespace() {
        let hooks = hooks();
        hooks
            .merge_user_configs(&[config(Namespace::UserProfile, "p1"), config(Namespace::UserContacts, "c1")])
            .await
            .unwrap();
        hooks.merge_user_configs(&[config(Namespace::UserProfile, "p2")]).await.unwrap();
        hooks.merge_group_configs("03aa", &[config(Namespace::GroupInfo, "i1")]).await.unwrap();

        assert_eq!(hooks.active_hashes(IdentityKind::Private, "05me").await.unwrap(), vec!["c1", "p2"]);
        assert_eq!(hooks.active_hashes(IdentityKind::GroupV2, "03aa").await.unwrap(), vec!["i1"]);
        assert!(hooks.active_hashes(IdentityKind::GroupV2, "03cc").await.unwrap().is_empty());
        assert!(hooks.active_hashes(IdentityKind::LegacyGroup, "05bb").await.unwrap().is_empty());
    }
}
