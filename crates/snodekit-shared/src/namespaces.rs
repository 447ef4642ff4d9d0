//! Storage namespaces.
//!
//! Each identity's data on a swarm is partitioned by a signed 16-bit
//! namespace id. Cursors, polling sets and routing decisions are all keyed by
//! namespace, so the set is a closed enum.

use serde::{Deserialize, Serialize};

use crate::types::IdentityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum Namespace {
    Default,
    UserProfile,
    UserContacts,
    ConvoInfoVolatile,
    UserGroups,
    GroupMessages,
    GroupKeys,
    GroupInfo,
    GroupMembers,
    GroupRevokedRetrievableMessages,
    LegacyClosedGroup,
}

/// Where a namespace's messages go once retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceRole {
    UserConfig,
    GroupConfig,
    Revocation,
    Messages,
}

impl Namespace {
    pub fn id(self) -> i16 {
        match self {
            Namespace::Default => 0,
            Namespace::UserProfile => 2,
            Namespace::UserContacts => 3,
            Namespace::ConvoInfoVolatile => 4,
            Namespace::UserGroups => 5,
            Namespace::GroupMessages => 11,
            Namespace::GroupKeys => 12,
            Namespace::GroupInfo => 13,
            Namespace::GroupMembers => 14,
            Namespace::GroupRevokedRetrievableMessages => -11,
            Namespace::LegacyClosedGroup => -10,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        let ns = match id {
            0 => Namespace::Default,
            2 => Namespace::UserProfile,
            3 => Namespace::UserContacts,
            4 => Namespace::ConvoInfoVolatile,
            5 => Namespace::UserGroups,
            11 => Namespace::GroupMessages,
            12 => Namespace::GroupKeys,
            13 => Namespace::GroupInfo,
            14 => Namespace::GroupMembers,
            -11 => Namespace::GroupRevokedRetrievableMessages,
            -10 => Namespace::LegacyClosedGroup,
            _ => return None,
        };
        Some(ns)
    }

    pub fn is_user_config(self) -> bool {
        matches!(
            self,
            Namespace::UserProfile
                | Namespace::UserContacts
                | Namespace::ConvoInfoVolatile
                | Namespace::UserGroups
        )
    }

    pub fn is_group_config(self) -> bool {
        matches!(
            self,
            Namespace::GroupKeys | Namespace::GroupInfo | Namespace::GroupMembers
        )
    }

    pub fn role(self) -> NamespaceRole {
        match self {
            ns if ns.is_user_config() => NamespaceRole::UserConfig,
            ns if ns.is_group_config() => NamespaceRole::GroupConfig,
            Namespace::GroupRevokedRetrievableMessages => NamespaceRole::Revocation,
            _ => NamespaceRole::Messages,
        }
    }

    /// Ordering stage inside one retrieve. Keys are only fetched once the
    /// info and members configs that reference them have been requested.
    pub fn retrieval_stage(self) -> u8 {
        match self {
            Namespace::GroupKeys => 1,
            _ => 0,
        }
    }

    /// Namespaces polled for an identity of the given kind, in retrieval order.
    pub fn polled_for(kind: IdentityKind) -> Vec<Namespace> {
        let mut namespaces = match kind {
            IdentityKind::Private => vec![
                Namespace::Default,
                Namespace::UserProfile,
                Namespace::UserContacts,
                Namespace::UserGroups,
                Namespace::ConvoInfoVolatile,
            ],
            IdentityKind::GroupV2 => vec![
                Namespace::GroupRevokedRetrievableMessages,
                Namespace::GroupMessages,
                Namespace::GroupInfo,
                Namespace::GroupMembers,
                Namespace::GroupKeys,
            ],
            IdentityKind::LegacyGroup => vec![Namespace::LegacyClosedGroup],
        };
        // stable: keeps the listed order within a stage
        namespaces.sort_by_key(|ns| ns.retrieval_stage());
        namespaces
    }
}

impl From<Namespace> for i16 {
    fn from(ns: Namespace) -> Self {
        ns.id()
    }
}

impl TryFrom<i16> for Namespace {
    type Error = String;

    fn try_from(id: i16) -> Result<Self, Self::Error> {
        Namespace::from_id(id).ok_or_else(|| format!("unknown namespace {id}"))
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}
