use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::constants::UNROUTABLE_IP;

/// A storage node. Two nodes are the same node when their ed25519 keys match,
/// whatever the other fields say.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snode {
    pub ip: String,
    pub port: u16,
    pub pubkey_x25519: String,
    pub pubkey_ed25519: String,
    #[serde(default)]
    pub storage_server_version: Vec<u16>,
}

impl Snode {
    /// The `/24` prefix of the node's ip (everything before the last dot).
    pub fn subnet(&self) -> &str {
        subnet_of(&self.ip)
    }

    /// `false` for the placeholder ip the network hands out for nodes that
    /// are registered but not reachable.
    pub fn is_routable(&self) -> bool {
        !self.ip.is_empty() && self.ip != UNROUTABLE_IP
    }

    pub fn meets_version(&self, minimum: &[u16]) -> bool {
        version_at_least(&self.storage_server_version, minimum)
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("https://{}:{}{}", self.ip, self.port, endpoint)
    }

    pub fn short(&self) -> String {
        short_key(&self.pubkey_ed25519)
    }

    pub fn x25519_bytes(&self) -> Option<[u8; 32]> {
        hex_key(&self.pubkey_x25519)
    }
}

impl PartialEq for Snode {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey_ed25519 == other.pubkey_ed25519
    }
}

impl Eq for Snode {}

impl Hash for Snode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pubkey_ed25519.hash(state);
    }
}

pub fn subnet_of(ip: &str) -> &str {
    match ip.rfind('.') {
        Some(idx) => &ip[..idx],
        None => ip,
    }
}

/// Lexicographic comparison, missing components count as zero.
pub fn version_at_least(version: &[u16], minimum: &[u16]) -> bool {
    let len = version.len().max(minimum.len());
    for i in 0..len {
        let have = version.get(i).copied().unwrap_or(0);
        let want = minimum.get(i).copied().unwrap_or(0);
        if have != want {
            return have > want;
        }
    }
    true
}

/// Render a key as `(...abcd)` for logs.
pub fn short_key(key: &str) -> String {
    let tail = key.len().saturating_sub(4);
    format!("(...{})", &key[tail..])
}

pub fn hex_key(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// The kind of identity a swarm belongs to. Decides which namespaces are
/// polled and how results are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    /// Our own account.
    Private,
    /// A `03`-prefixed closed group.
    GroupV2,
    /// A `05`-prefixed legacy closed group, read only.
    LegacyGroup,
}

impl IdentityKind {
    pub fn is_group(self) -> bool {
        matches!(self, IdentityKind::GroupV2 | IdentityKind::LegacyGroup)
    }
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IdentityKind::Private => "private",
            IdentityKind::GroupV2 => "group",
            IdentityKind::LegacyGroup => "legacy-group",
        };
        f.write_str(name)
    }
}

pub const GROUP_V2_PREFIX: &str = "03";
pub const STANDARD_PREFIX: &str = "05";

/// Hex length of a prefixed 33-byte account id.
pub const ACCOUNT_ID_HEX_LEN: usize = 66;

pub fn is_group_v2_pubkey(pubkey: &str) -> bool {
    pubkey.len() == ACCOUNT_ID_HEX_LEN
        && pubkey.starts_with(GROUP_V2_PREFIX)
        && hex::decode(pubkey).is_ok()
}

pub fn is_standard_pubkey(pubkey: &str) -> bool {
    pubkey.len() == ACCOUNT_ID_HEX_LEN
        && pubkey.starts_with(STANDARD_PREFIX)
        && hex::decode(pubkey).is_ok()
}
