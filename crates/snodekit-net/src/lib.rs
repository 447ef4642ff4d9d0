// Storage swarm networking: snode pool, onion paths, swarm lookup and polling.

pub mod dns;
pub mod error;
pub mod link;
pub mod network_time;
pub mod node_pool;
pub mod onion;
pub mod polling;
pub mod presence;
pub mod retry;
pub mod seed;
pub mod service;
pub mod snode_api;
pub mod swarm;

mod locks;

#[cfg(test)]
mod testing;

pub use dns::build_doh_resolver;
pub use error::{
    EnvelopeError, LinkError, NetError, PathError, PollError, PoolError, SnodeApiError,
    TransportError,
};
pub use link::{HttpLink, SnodeLink};
pub use network_time::NetworkTime;
pub use node_pool::{NodePool, NodePoolConfig, PoolRefreshListener, RefreshSource};
pub use onion::envelope::{Destination, V4Body, V4Response};
pub use onion::paths::{OnionPathBuilder, PathConfig, PathStatus};
pub use onion::transport::{OnionRequest, OnionRequestTransport, SendOptions, TransportConfig};
pub use polling::{PollerConfig, PollerHooks, SwarmPoller};
pub use presence::Presence;
pub use retry::RetryPolicy;
pub use service::{CleanupReport, NetworkConfig, NetworkStatus, SnodeNetwork};
pub use snode_api::{IdentityAuth, RetrieveAuth, SnodeApi};
pub use swarm::{SwarmDirectory, SwarmDirectoryConfig};
