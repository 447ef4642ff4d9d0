use thiserror::Error;

use snodekit_shared::{CryptoError, Snode};
use snodekit_store::StoreError;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Node pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Onion path error: {0}")]
    Path(#[from] PathError),

    #[error("Onion transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Snode RPC error: {0}")]
    Api(#[from] SnodeApiError),

    #[error("Polling error: {0}")]
    Poll(#[from] PollError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Not enough snodes: have {available}, need {required}")]
    NotEnoughNodes { available: usize, required: usize },

    #[error("No snode left after excluding {excluded} nodes")]
    NoCandidates { excluded: usize },

    #[error("Consensus not reached: {0}")]
    Consensus(String),

    #[error("Seed fetch failed: {0}")]
    Seed(String),
}

/// Failure talking to the first hop (or a seed) over HTTP.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Request timed out")]
    Timeout,

    #[error("Could not connect: {0}")]
    Connect(String),

    #[error("HTTP status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Envelope truncated: {0}")]
    Truncated(&'static str),

    #[error("Not a v4 envelope: {0}")]
    NotV4(String),

    #[error("Invalid x25519 key: {0}")]
    InvalidKey(String),

    #[error("Invalid routing info: {0}")]
    Routing(String),

    #[error("Envelope JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Not enough snodes to build a path: {0}")]
    Pool(#[from] PoolError),

    #[error("Only {found} guard nodes usable, need {required}")]
    NotEnoughGuards { found: usize, required: usize },

    #[error("No onion path avoids the excluded nodes")]
    NoUsablePath,

    #[error("Guard persistence failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No onion path available: {0}")]
    NoPath(#[from] PathError),

    #[error("Request aborted")]
    Aborted,

    #[error("Destination returned 404")]
    NotFound,

    #[error("Local clock out of sync with the network")]
    ClockOutOfSync,

    #[error("Destination snode {0} unreachable")]
    DestinationUnreachable(String),

    #[error("Link failure: {0}")]
    Link(LinkError),

    #[error("Destination returned status {code}")]
    Status { code: u16 },

    #[error("Malformed onion envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Could not decrypt the response: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum SnodeApiError {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Snode answered with status {0}")]
    Status(u16),

    #[error("Snode {snode} is not part of the swarm")]
    WrongSwarm {
        snode: String,
        /// Swarm the snode suggested instead, if any.
        replacement: Vec<Snode>,
    },

    #[error("Invalid snode response: {0}")]
    InvalidResponse(String),

    #[error("Snode response JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not authenticate request: {0}")]
    Auth(String),
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Swarm of {pubkey} has only {found} usable snodes")]
    NotEnoughSwarmNodes { pubkey: String, found: usize },

    #[error("{0}")]
    Api(#[from] SnodeApiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Hook failed: {0}")]
    Hook(#[from] anyhow::Error),

    #[error("Poll aborted")]
    Aborted,

    #[error("No snode in the swarm has a user profile config")]
    NoProfileConfig,
}
