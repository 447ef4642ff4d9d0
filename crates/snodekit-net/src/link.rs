//! The single place bytes leave the process.
//!
//! Everything above this layer builds onion blobs and JSON-RPC bodies; a
//! [`SnodeLink`] only moves them over HTTPS to a guard node or a seed host.

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use snodekit_shared::constants::{ONION_REQUEST_ENDPOINT, STORAGE_RPC_ENDPOINT};
use snodekit_shared::Snode;

use crate::dns::{build_doh_resolver, resolve_host};
use crate::error::LinkError;

#[async_trait]
pub trait SnodeLink: Send + Sync {
    /// POST an onion blob to `guard` and return the raw (still encrypted)
    /// reply.
    async fn send_onion(
        &self,
        guard: &Snode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError>;

    /// Cheap reachability check, used to vet guard candidates.
    async fn probe(&self, node: &Snode, timeout: Duration) -> Result<(), LinkError>;

    /// POST a JSON-RPC body straight to a seed host.
    async fn post_seed(
        &self,
        seed_url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError>;
}

/// [`SnodeLink`] over reqwest.
///
/// Snodes serve self-signed certificates (the onion layers carry the real
/// authentication), so the snode client skips certificate validation. Seed
/// hosts are validated normally.
pub struct HttpLink {
    snode_client: reqwest::Client,
    seed_client: reqwest::Client,
    resolver: Option<TokioAsyncResolver>,
}

impl HttpLink {
    pub fn new(use_doh: bool) -> Result<Self, LinkError> {
        let snode_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| LinkError::Http(e.to_string()))?;
        let seed_client = reqwest::Client::builder()
            .build()
            .map_err(|e| LinkError::Http(e.to_string()))?;

        Ok(Self {
            snode_client,
            seed_client,
            resolver: use_doh.then(build_doh_resolver),
        })
    }

    /// Client for `seed_url`, pinned to the DoH answer when enabled.
    async fn client_for_seed(&self, seed_url: &str) -> Result<reqwest::Client, LinkError> {
        let Some(resolver) = &self.resolver else {
            return Ok(self.seed_client.clone());
        };

        let url = reqwest::Url::parse(seed_url)
            .map_err(|e| LinkError::Http(format!("invalid seed url {seed_url}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| LinkError::Http(format!("seed url {seed_url} has no host")))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let addr = resolve_host(resolver, host, port).await?;

        reqwest::Client::builder()
            .resolve(host, addr)
            .build()
            .map_err(|e| LinkError::Http(e.to_string()))
    }
}

async fn post_bytes(
    client: &reqwest::Client,
    url: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, LinkError> {
    let response = client
        .post(url)
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(map_reqwest_error)?;

    let status = response.status();
    let bytes = response.bytes().await.map_err(map_reqwest_error)?;

    if !status.is_success() {
        return Err(LinkError::Status {
            code: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(bytes.to_vec())
}

fn map_reqwest_error(e: reqwest::Error) -> LinkError {
    if e.is_timeout() {
        LinkError::Timeout
    } else if e.is_connect() {
        LinkError::Connect(e.to_string())
    } else {
        LinkError::Http(e.to_string())
    }
}

#[async_trait]
impl SnodeLink for HttpLink {
    async fn send_onion(
        &self,
        guard: &Snode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        debug!(guard = %guard.short(), bytes = payload.len(), "sending onion request");
        post_bytes(
            &self.snode_client,
            &guard.url(ONION_REQUEST_ENDPOINT),
            payload,
            timeout,
        )
        .await
    }

    async fn probe(&self, node: &Snode, timeout: Duration) -> Result<(), LinkError> {
        let body = serde_json::json!({ "method": "info", "params": {} });
        post_bytes(
            &self.snode_client,
            &node.url(STORAGE_RPC_ENDPOINT),
            body.to_string().into_bytes(),
            timeout,
        )
        .await
        .map(|_| ())
    }

    async fn post_seed(
        &self,
        seed_url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let client = self.client_for_seed(seed_url).await?;
        let url = format!("{}/json_rpc", seed_url.trim_end_matches('/'));
        post_bytes(&client, &url, body, timeout).await
    }
}
