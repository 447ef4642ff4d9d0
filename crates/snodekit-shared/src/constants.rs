/// Application name
pub const APP_NAME: &str = "snodekit";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

// ---------------------------------------------------------------------------
// Node pool
// ---------------------------------------------------------------------------

/// Below this many nodes the pool is refetched before sampling.
pub const MIN_SNODE_POOL_COUNT: usize = 12;

/// Pool size required before we trust the snodes themselves for a refresh.
pub const MIN_SNODE_POOL_COUNT_BEFORE_REFRESH_FROM_SNODES: usize = 24;

/// Size of the common node set required for a consensus refresh.
pub const REQUIRED_SNODES_FOR_AGREEMENT: usize = 24;

/// Same as above, on a local devnet with fewer nodes.
pub const REQUIRED_SNODES_FOR_AGREEMENT_DEVNET: usize = 12;

/// Number of snodes queried for their view of the pool.
pub const CONSENSUS_SAMPLE_SIZE: usize = 3;

/// Swarm caches are only pruned against pools larger than this.
pub const MIN_POOL_FOR_SWARM_CLEANUP: usize = 10;

/// An ip that no node can ever be reached at.
pub const UNROUTABLE_IP: &str = "0.0.0.0";

// ---------------------------------------------------------------------------
// Swarms and paths
// ---------------------------------------------------------------------------

pub const MIN_SWARM_SNODE_COUNT: usize = 3;

pub const ONION_PATH_COUNT: usize = 3;

pub const ONION_PATH_LENGTH: usize = 3;

/// Exit hops must run at least this storage server version.
pub const MIN_EDGE_STORAGE_SERVER_VERSION: [u16; 3] = [2, 8, 0];

pub const SNODE_FAILURE_THRESHOLD: u32 = 3;

pub const PATH_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive connect failures before presence flips to offline.
pub const OFFLINE_AFTER_CONNECT_FAILURES: u32 = 3;

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Number of swarm members each poll retrieves from.
pub const RETRIEVE_SNODES_COUNT: usize = 2;

pub const POLL_ACTIVE_INTERVAL_MS: i64 = 5_000;
pub const POLL_MEDIUM_ACTIVE_INTERVAL_MS: i64 = 60_000;
pub const POLL_INACTIVE_INTERVAL_MS: i64 = 120_000;

pub const ACTIVE_WITHIN_MS: i64 = 2 * DAY_MS;
pub const MEDIUM_ACTIVE_WITHIN_MS: i64 = 7 * DAY_MS;

/// A poll returning at least this many messages probably left a next page behind.
pub const MIN_MSG_COUNT_SHOULD_RETRY: usize = 95;

/// Extra slack subtracted when back-dating the last poll.
pub const BACKDATE_SLACK_MS: i64 = 5_000;

pub const FIRST_POLL_DELAY_MS: u64 = 4_000;

pub const ALREADY_TRACKED_CALLBACK_DELAY_MS: u64 = 2_000;

pub const ENVELOPE_DISPATCH_TIMEOUT_MS: u64 = 60_000;

/// Expiry requested for live config messages on every poll.
pub const CONFIG_MESSAGE_TTL_MS: i64 = 30 * DAY_MS;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

pub const ONION_REQUEST_ENDPOINT: &str = "/onion_req/v2";

pub const STORAGE_RPC_ENDPOINT: &str = "/storage_rpc/v1";

/// Target used by exit hops when the destination is an HTTP server.
pub const V4_LSRPC_TARGET: &str = "/oxen/v4/lsrpc";

pub const ENC_TYPE_XCHACHA20: &str = "xchacha20";

/// Body marker a server sends when it needs blinded ids.
pub const REQUIRES_BLINDING_MARKER: &str =
    "Invalid authentication: this server requires the use of blinded ids";

pub const NEXT_NODE_NOT_FOUND_PREFIX: &str = "Next node not found: ";

pub const NEXT_NODE_UNREACHABLE_PREFIX: &str = "Next node is currently unreachable: ";

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Public seed nodes used when nothing else is configured
pub const DEFAULT_SEED_URLS: &[&str] = &[
    "https://seed1.getsession.org:4443",
    "https://seed2.getsession.org:4443",
    "https://seed3.getsession.org:4443",
];

/// DNS over HTTPS servers
pub const DOH_CLOUDFLARE: &str = "1.1.1.1";
pub const DOH_GOOGLE: &str = "8.8.8.8";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_ONION_LAYER: &str = "snodekit-onion-layer-v1";
