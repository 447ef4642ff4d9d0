//! DNS-over-HTTPS resolver for seed bootstrap.
//!
//! Seed hosts are the only names this crate ever resolves. Routing those
//! lookups through Cloudflare (1.1.1.1) and Google (8.8.8.8) DoH endpoints
//! keeps a local resolver from blocking or observing the bootstrap.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use tracing::{debug, info};

use snodekit_shared::constants::{DOH_CLOUDFLARE, DOH_GOOGLE};

use crate::error::LinkError;

/// Build a DNS-over-HTTPS async resolver that queries only Cloudflare and Google.
pub fn build_doh_resolver() -> TokioAsyncResolver {
    let cloudflare_addr: IpAddr = DOH_CLOUDFLARE
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
    let google_addr: IpAddr = DOH_GOOGLE
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));

    let cloudflare_ns = NameServerConfig {
        socket_addr: SocketAddr::new(cloudflare_addr, 443),
        protocol: Protocol::Https,
        tls_dns_name: Some("cloudflare-dns.com".to_string()),
        trust_negative_responses: false,
        tls_config: None,
        bind_addr: None,
    };

    let google_ns = NameServerConfig {
        socket_addr: SocketAddr::new(google_addr, 443),
        protocol: Protocol::Https,
        tls_dns_name: Some("dns.google".to_string()),
        trust_negative_responses: false,
        tls_config: None,
        bind_addr: None,
    };

    let mut resolver_config = ResolverConfig::new();
    resolver_config.add_name_server(cloudflare_ns);
    resolver_config.add_name_server(google_ns);

    let mut opts = ResolverOpts::default();
    opts.num_concurrent_reqs = 2;
    opts.cache_size = 64;
    opts.rotate = true;

    info!("Built DoH resolver with Cloudflare (1.1.1.1) and Google (8.8.8.8)");

    TokioAsyncResolver::tokio(resolver_config, opts)
}

/// Resolve `host` to a socket address on `port`. Literal ips skip the lookup.
pub async fn resolve_host(
    resolver: &TokioAsyncResolver,
    host: &str,
    port: u16,
) -> Result<SocketAddr, LinkError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| LinkError::Connect(format!("DoH lookup for {host} failed: {e}")))?;

    let ip = lookup
        .iter()
        .next()
        .ok_or_else(|| LinkError::Connect(format!("no address for {host}")))?;

    debug!(host, %ip, "resolved seed host over DoH");
    Ok(SocketAddr::new(ip, port))
}
