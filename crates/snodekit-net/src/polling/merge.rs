//! Combining what the sampled swarm members returned.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use snodekit_shared::{Namespace, NamespaceRole};

use crate::snode_api::RetrieveResult;

/// A stored message together with the namespace it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedMessage {
    pub namespace: Namespace,
    pub hash: String,
    /// base64, as stored on the snode
    pub data: String,
    pub expiration: i64,
    pub stored_at: i64,
}

impl RetrievedMessage {
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Retrieved messages split by where they are routed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Categorized {
    pub configs: Vec<RetrievedMessage>,
    pub revoked: Vec<RetrievedMessage>,
    pub others: Vec<RetrievedMessage>,
}

/// Flatten per-node results into one list holding each hash once.
///
/// The output does not depend on the order of `per_node`: duplicates keep
/// the latest expiration and the list is sorted by storage time, then hash.
pub fn merge_results(per_node: Vec<Vec<RetrieveResult>>) -> Vec<RetrievedMessage> {
    let mut by_hash: HashMap<String, RetrievedMessage> = HashMap::new();

    for result in per_node.into_iter().flatten() {
        let namespace = result.namespace;
        for item in result.messages {
            let message = RetrievedMessage {
                namespace,
                hash: item.hash,
                data: item.data,
                expiration: item.expiration,
                stored_at: item.timestamp,
            };
            match by_hash.get_mut(&message.hash) {
                Some(existing) => {
                    if (message.expiration, message.stored_at) > (existing.expiration, existing.stored_at) {
                        *existing = message;
                    }
                }
                None => {
                    by_hash.insert(message.hash.clone(), message);
                }
            }
        }
    }

    let mut merged: Vec<RetrievedMessage> = by_hash.into_values().collect();
    merged.sort_by(|a, b| (a.stored_at, &a.hash).cmp(&(b.stored_at, &b.hash)));
    merged
}

pub fn categorize(messages: Vec<RetrievedMessage>) -> Categorized {
    let mut out = Categorized::default();
    for message in messages {
        match message.namespace.role() {
            NamespaceRole::UserConfig | NamespaceRole::GroupConfig => out.configs.push(message),
            NamespaceRole::Revocation => out.revoked.push(message),
            NamespaceRole::Messages => out.others.push(message),
        }
    }
    out
}
