//! What the poller needs from the application around it.
//!
//! Group membership, config merging, decryption and the receive pipeline
//! all live outside the networking core. The poller only decides what to
//! fetch and where the results go.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use snodekit_shared::IdentityKind;

use crate::polling::merge::RetrievedMessage;
use crate::snode_api::RetrieveAuth;

/// A v2 group as the local membership wrapper knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub pubkey: String,
    /// Invited but not accepted yet; tracked, never polled.
    pub invite_pending: bool,
    /// Approved, not blocked and not kicked.
    pub pollable: bool,
}

#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Every v2 group in the wrapper.
    async fn groups(&self) -> anyhow::Result<Vec<GroupMembership>>;

    /// Legacy groups still joined.
    async fn legacy_groups(&self) -> anyhow::Result<Vec<String>>;

    /// Last activity in the conversation, unix millis.
    async fn last_active_ms(&self, pubkey: &str) -> Option<i64>;

    /// Leave a group that is no longer in the wrapper.
    async fn leave_group(&self, pubkey: &str, kind: IdentityKind, reason: &str) -> anyhow::Result<()>;

    async fn is_group_expired(&self, pubkey: &str) -> bool;

    async fn set_group_expired(&self, pubkey: &str, expired: bool) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ConfigMerger: Send + Sync {
    async fn merge_user_configs(&self, messages: &[RetrievedMessage]) -> anyhow::Result<()>;

    async fn merge_group_configs(&self, group_pubkey: &str, messages: &[RetrievedMessage]) -> anyhow::Result<()>;

    /// Hashes of the config messages currently in use for `pubkey`. Each
    /// poll extends their expiry so live configs never lapse.
    async fn active_hashes(&self, kind: IdentityKind, pubkey: &str) -> anyhow::Result<Vec<String>>;
}

/// A retrieved message the pipeline could decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Hash of the retrieved message it came from.
    pub hash: String,
    pub sender: String,
    pub plaintext: Vec<u8>,
    pub sent_at_ms: i64,
}

/// What the receive pipeline gets for each new message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingEnvelope {
    pub id: Uuid,
    pub kind: IdentityKind,
    /// Group pubkey for group messages, the sender otherwise.
    pub source: String,
    /// Sender inside a group.
    pub sender_identity: Option<String>,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub received_at_ms: i64,
    pub message_hash: String,
    pub sent_at_ms: i64,
    pub expiration_ms: i64,
}

impl IncomingEnvelope {
    pub fn new(
        kind: IdentityKind,
        pubkey: &str,
        message: DecryptedMessage,
        expiration_ms: i64,
        received_at_ms: i64,
    ) -> Self {
        let (source, sender_identity) = if kind.is_group() {
            (pubkey.to_string(), Some(message.sender))
        } else {
            (message.sender, None)
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            source,
            sender_identity,
            content: message.plaintext,
            received_at_ms,
            message_hash: message.hash,
            sent_at_ms: message.sent_at_ms,
            expiration_ms,
        }
    }
}

#[async_trait]
pub trait MessagePipeline: Send + Sync {
    async fn has_group_keys(&self, group_pubkey: &str) -> bool;

    /// Decrypt what can be decrypted; failures are left out.
    async fn decrypt(
        &self,
        kind: IdentityKind,
        pubkey: &str,
        messages: &[RetrievedMessage],
    ) -> anyhow::Result<Vec<DecryptedMessage>>;

    /// Revocation messages of a group, handled before anything else in it.
    async fn handle_revoked(&self, group_pubkey: &str, messages: &[RetrievedMessage]) -> anyhow::Result<()>;

    async fn dispatch(&self, envelope: IncomingEnvelope) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PollerHooks {
    pub membership: Arc<dyn MembershipSource>,
    pub configs: Arc<dyn ConfigMerger>,
    pub pipeline: Arc<dyn MessagePipeline>,
    pub auth: Arc<dyn RetrieveAuth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decrypted() -> DecryptedMessage {
        DecryptedMessage {
            hash: "h".to_string(),
            sender: "05sender".to_string(),
            plaintext: vec![1, 2],
            sent_at_ms: 5,
        }
    }

    #[test]
    fn test_group_envelope_keeps_group_as_source() {
        let envelope = IncomingEnvelope::new(IdentityKind::GroupV2, "03group", decrypted(), 9, 10);
        assert_eq!(envelope.source, "03group");
        assert_eq!(envelope.sender_identity.as_deref(), Some("05sender"));
        assert_eq!(envelope.expiration_ms, 9);
        assert_eq!(envelope.message_hash, "h");
    }

    #[test]
    fn test_private_envelope_uses_sender() {
        let a = IncomingEnvelope::new(IdentityKind::Private, "05me", decrypted(), 9, 10);
        let b = IncomingEnvelope::new(IdentityKind::Private, "05me", decrypted(), 9, 10);
        assert_eq!(a.source, "05sender");
        assert!(a.sender_identity.is_none());
        assert_ne!(a.id, b.id);
    }
}
