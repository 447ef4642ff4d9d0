//! Records persisted by the store that are not plain [`Snode`]s.
//!
//! [`Snode`]: snodekit_shared::Snode

use serde::{Deserialize, Serialize};

/// Retrieve cursor for one (snode, conversation, namespace) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastHashRecord {
    /// ed25519 key of the snode the hash was retrieved from.
    pub snode: String,
    pub convo_id: String,
    pub namespace: i16,
    pub hash: String,
    /// Expiry of the message the hash points at (unix millis).
    pub expires_at: i64,
}

/// A message hash that has already been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenMessageHash {
    pub hash: String,
    pub conversation_id: String,
    pub expires_at: i64,
}
