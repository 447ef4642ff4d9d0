//! Sending requests through onion paths.
//!
//! Each attempt takes a path, wraps the v4 request for the destination,
//! posts it to the guard and decodes the reply. Guard-level failures are
//! pinned on a hop or on the whole path; the destination's own status code
//! decides whether another attempt is worth it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snodekit_shared::constants::{
    DEFAULT_REQUEST_TIMEOUT_MS, NEXT_NODE_NOT_FOUND_PREFIX, NEXT_NODE_UNREACHABLE_PREFIX,
    REQUIRES_BLINDING_MARKER, SNODE_FAILURE_THRESHOLD,
};
use snodekit_shared::crypto::decrypt;
use snodekit_shared::{short_key, Snode};

use crate::error::{LinkError, PathError, TransportError};
use crate::link::SnodeLink;
use crate::locks::lock;
use crate::node_pool::{NodePool, PoolRefreshListener, RefreshSource};
use crate::onion::envelope::{
    build_onion_packet, decode_v4_response, encode_v4_request, Destination, V4RequestInfo,
    V4Response,
};
use crate::onion::paths::OnionPathBuilder;
use crate::presence::Presence;
use crate::retry::{retry, Attempt, RetryPolicy};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub snode_failure_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(2, 1, Duration::from_millis(100), Duration::from_millis(100)),
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            snode_failure_threshold: SNODE_FAILURE_THRESHOLD,
        }
    }
}

/// What the destination should execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionRequest {
    pub method: String,
    /// Path and query string.
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl OnionRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post_json(endpoint: impl Into<String>, body: &Value) -> Self {
        Self {
            method: "POST".to_string(),
            endpoint: endpoint.into(),
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Some(body.to_string().into_bytes()),
        }
    }

    fn info(&self) -> V4RequestInfo {
        V4RequestInfo {
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Hand non-2xx statuses back instead of retrying them.
    pub allow_error_codes: bool,
    /// Identity whose swarm the destination belongs to, for logs.
    pub associated_with: Option<String>,
}

impl SendOptions {
    pub fn allowing_error_codes() -> Self {
        Self {
            allow_error_codes: true,
            ..Self::default()
        }
    }
}

/// Per-snode failure counts across all requests.
struct SnodeFailures {
    threshold: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl SnodeFailures {
    /// Count one failure; `true` once the node reached the threshold, which
    /// also resets its count.
    fn record(&self, pubkey_ed25519: &str) -> bool {
        let mut counts = lock(&self.counts);
        let count = counts.entry(pubkey_ed25519.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            counts.remove(pubkey_ed25519);
            true
        } else {
            false
        }
    }

    fn reset(&self) {
        lock(&self.counts).clear();
    }
}

pub struct OnionRequestTransport {
    config: TransportConfig,
    paths: Arc<OnionPathBuilder>,
    pool: Arc<NodePool>,
    link: Arc<dyn SnodeLink>,
    presence: Arc<Presence>,
    failures: SnodeFailures,
}

impl OnionRequestTransport {
    pub fn new(
        config: TransportConfig,
        paths: Arc<OnionPathBuilder>,
        pool: Arc<NodePool>,
        link: Arc<dyn SnodeLink>,
        presence: Arc<Presence>,
    ) -> Self {
        let failures = SnodeFailures {
            threshold: config.snode_failure_threshold.max(1),
            counts: Mutex::new(HashMap::new()),
        };
        Self {
            config,
            paths,
            pool,
            link,
            presence,
            failures,
        }
    }

    pub fn presence(&self) -> &Arc<Presence> {
        &self.presence
    }

    pub fn paths(&self) -> &Arc<OnionPathBuilder> {
        &self.paths
    }

    /// Send `request` to `destination`, retrying on retryable failures.
    pub async fn send(
        &self,
        destination: &Destination,
        request: &OnionRequest,
        options: &SendOptions,
    ) -> Result<V4Response, TransportError> {
        let encoded = encode_v4_request(&request.info(), request.body.as_deref())?;
        let exclude: Vec<Snode> = match destination {
            Destination::Snode(node) => vec![node.clone()],
            Destination::Server(_) => Vec::new(),
        };

        let attempts = retry(&self.config.retry, "onion request", |attempt| {
            let encoded = &encoded;
            let exclude = &exclude;
            async move {
                if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    return Err(Attempt::Abort(TransportError::Aborted));
                }
                let path = self
                    .paths
                    .get_path(exclude)
                    .await
                    .map_err(|e| Attempt::Retry(TransportError::NoPath(e)))?;
                debug!(attempt, destination = %destination.describe(), "onion attempt");
                self.attempt(&path, destination, encoded, options).await
            }
        });

        let result = match &options.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TransportError::Aborted),
                    result = attempts => result,
                }
            }
            None => attempts.await,
        };

        if let Err(TransportError::NoPath(e)) = &result {
            warn!(error = %e, "no onion path after retries, refreshing the pool");
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.force_refresh().await;
            });
        }
        result
    }

    /// Like [`send`](Self::send), but failures are logged and turned into
    /// `None`.
    pub async fn send_or_none(
        &self,
        destination: &Destination,
        request: &OnionRequest,
        options: &SendOptions,
    ) -> Option<V4Response> {
        match self.send(destination, request, options).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(destination = %destination.describe(), error = %e, "onion request failed");
                None
            }
        }
    }

    /// One attempt over a caller-chosen path, without retries.
    pub async fn send_through_path(
        &self,
        path: &[Snode],
        destination: &Destination,
        request: &OnionRequest,
        options: &SendOptions,
    ) -> Result<V4Response, TransportError> {
        let encoded = encode_v4_request(&request.info(), request.body.as_deref())?;
        self.attempt(path, destination, &encoded, options)
            .await
            .map_err(Attempt::into_inner)
    }

    async fn attempt(
        &self,
        path: &[Snode],
        destination: &Destination,
        encoded: &[u8],
        options: &SendOptions,
    ) -> Result<V4Response, Attempt<TransportError>> {
        let guard = path
            .first()
            .ok_or(Attempt::Abort(TransportError::NoPath(PathError::NoUsablePath)))?;
        let packet =
            build_onion_packet(path, destination, encoded).map_err(|e| Attempt::Abort(e.into()))?;
        let timeout = options.timeout.unwrap_or(self.config.timeout);

        let raw = match self.link.send_onion(guard, packet.payload, timeout).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.handle_link_error(e, guard, destination, options).await),
        };
        self.presence.record_success();

        let plaintext =
            decrypt(&packet.destination_key, &raw).map_err(|e| Attempt::Abort(e.into()))?;
        let response = decode_v4_response(&plaintext).map_err(|e| Attempt::Abort(e.into()))?;
        classify_status(response, options.allow_error_codes)
    }

    async fn handle_link_error(
        &self,
        error: LinkError,
        guard: &Snode,
        destination: &Destination,
        options: &SendOptions,
    ) -> Attempt<TransportError> {
        match &error {
            LinkError::Status { code: 406, .. } => {
                self.presence.record_success();
                warn!("guard rejected our timestamp, local clock is off");
                Attempt::Abort(TransportError::ClockOutOfSync)
            }
            LinkError::Status { code: 502 | 503 | 504, body } if blamed_node(body).is_some() => {
                self.presence.record_success();
                let blamed = blamed_node(body).unwrap_or_default().to_string();
                self.record_snode_failure(&blamed).await;

                let is_destination = matches!(
                    destination,
                    Destination::Snode(node) if node.pubkey_ed25519 == blamed
                );
                if is_destination {
                    let associated = options.associated_with.as_deref().map(short_key);
                    warn!(
                        node = %short_key(&blamed),
                        associated_with = ?associated,
                        "destination snode unreachable"
                    );
                    Attempt::Abort(TransportError::DestinationUnreachable(blamed))
                } else {
                    Attempt::Retry(TransportError::Link(error))
                }
            }
            LinkError::Timeout | LinkError::Connect(_) => {
                self.presence.record_connect_failure();
                self.paths.increment_path_failure(guard).await;
                Attempt::Retry(TransportError::Link(error))
            }
            LinkError::Status { .. } | LinkError::Http(_) => {
                self.paths.increment_path_failure(guard).await;
                Attempt::Retry(TransportError::Link(error))
            }
        }
    }

    /// Count a failure against one snode; at the threshold it leaves the
    /// pool and every path.
    pub async fn record_snode_failure(&self, pubkey_ed25519: &str) {
        if !self.failures.record(pubkey_ed25519) {
            debug!(node = %short_key(pubkey_ed25519), "snode failure recorded");
            return;
        }
        info!(node = %short_key(pubkey_ed25519), "snode failed too often, ejecting it");
        self.pool.drop_node(pubkey_ed25519).await;
        self.paths
            .drop_node_from_path(pubkey_ed25519, "failure threshold reached")
            .await;
    }

    /// Probe the guard of any path, updating presence. Used while offline.
    pub async fn check_connectivity(&self) -> bool {
        let path = match self.paths.get_path(&[]).await {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, "no path to probe connectivity with");
                return false;
            }
        };
        let Some(guard) = path.first() else {
            return false;
        };

        match self.link.probe(guard, self.config.timeout).await {
            Ok(()) => {
                self.presence.record_success();
                true
            }
            Err(e) => {
                debug!(guard = %guard.short(), error = %e, "connectivity probe failed");
                if matches!(e, LinkError::Timeout | LinkError::Connect(_)) {
                    self.presence.record_connect_failure();
                }
                false
            }
        }
    }
}

impl PoolRefreshListener for OnionRequestTransport {
    fn on_pool_refreshed(&self, _source: RefreshSource) {
        self.failures.reset();
    }
}

/// ed25519 key named by a guard's "next node" error body.
fn blamed_node(body: &str) -> Option<&str> {
    let body = body.trim();
    body.strip_prefix(NEXT_NODE_NOT_FOUND_PREFIX)
        .or_else(|| body.strip_prefix(NEXT_NODE_UNREACHABLE_PREFIX))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

fn classify_status(
    response: V4Response,
    allow_error_codes: bool,
) -> Result<V4Response, Attempt<TransportError>> {
    let code = response.code;
    if (200..300).contains(&code) {
        return Ok(response);
    }

    let needs_blinding = code == 400
        && String::from_utf8_lossy(&response.body_bytes).contains(REQUIRES_BLINDING_MARKER);
    if needs_blinding {
        return Ok(response);
    }
    if code == 404 {
        return Err(Attempt::Abort(TransportError::NotFound));
    }
    if allow_error_codes {
        return Ok(response);
    }
    Err(Attempt::Retry(TransportError::Status { code }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{OnionFixture, Reply};
    use serde_json::json;

    fn info_request() -> OnionRequest {
        OnionRequest::post_json("/storage_rpc/v1", &json!({ "method": "info" }))
    }

    #[tokio::test]
    async fn test_success_decodes_json_body() {
        let fx = OnionFixture::new(|node, info, body| {
            assert_eq!(info.endpoint, "/storage_rpc/v1");
            let body: Value = serde_json::from_slice(body.unwrap()).unwrap();
            assert_eq!(body["method"], "info");
            Reply::json(200, json!({ "served_by": node.pubkey_ed25519 }))
        });
        let dest = fx.destination(29);

        let response = fx.transport.send(&dest, &info_request(), &SendOptions::default()).await.unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.body.as_json().unwrap()["served_by"], crate::testing::ed_key(29));
        assert_eq!(fx.net.sends(), 1);
        assert!(fx.transport.presence().is_online());
    }

    #[tokio::test]
    async fn test_path_never_contains_destination() {
        let fx = OnionFixture::new(|_, _, _| Reply::json(200, json!({})));
        for i in 0..10 {
            let dest = fx.destination(i);
            fx.transport.send(&dest, &info_request(), &SendOptions::default()).await.unwrap();

            let route = fx.net.last_route();
            assert_eq!(route.len(), 4);
            assert_eq!(route.last(), Some(&crate::testing::ed_key(i)));
            assert_eq!(route.iter().filter(|k| **k == crate::testing::ed_key(i)).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_404_is_terminal() {
        let fx = OnionFixture::new(|_, _, _| Reply::text(404, "no such thing"));
        let err = fx
            .transport
            .send(&fx.destination(29), &info_request(), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound));
        assert_eq!(fx.net.sends(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let fx = OnionFixture::new(|_, _, _| Reply::text(500, "busy"));
        let err = fx
            .transport
            .send(&fx.destination(29), &info_request(), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { code: 500 }));
        assert_eq!(fx.net.sends(), 3);
    }

    #[tokio::test]
    async fn test_allowed_error_codes_pass_through() {
        let fx = OnionFixture::new(|_, _, _| Reply::text(500, "busy"));
        let response = fx
            .transport
            .send(&fx.destination(29), &info_request(), &SendOptions::allowing_error_codes())
            .await
            .unwrap();
        assert_eq!(response.code, 500);
        assert_eq!(fx.net.sends(), 1);
    }

    #[tokio::test]
    async fn test_blinding_required_is_structured() {
        let fx = OnionFixture::new(|_, _, _| Reply::text(400, REQUIRES_BLINDING_MARKER));
        let response = fx
            .transport
            .send(&fx.destination(29), &info_request(), &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(response.code, 400);
        assert_eq!(response.body.as_text(), Some(REQUIRES_BLINDING_MARKER));
        assert_eq!(fx.net.sends(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_never_sent() {
        let fx = OnionFixture::new(|_, _, _| Reply::json(200, json!({})));
        let token = CancellationToken::new();
        token.cancel();
        let options = SendOptions {
            cancel: Some(token),
            ..SendOptions::default()
        };
        let err = fx.transport.send(&fx.destination(29), &info_request(), &options).await.unwrap_err();
        assert!(matches!(err, TransportError::Aborted));
        assert_eq!(fx.net.sends(), 0);
    }

    #[tokio::test]
    async fn test_clock_out_of_sync_is_terminal() {
        let fx = OnionFixture::new(|_, _, _| Reply::json(200, json!({})));
        fx.net.set_guard_status(Some(406));
        let err = fx
            .transport
            .send(&fx.destination(29), &info_request(), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ClockOutOfSync));
        assert_eq!(fx.net.sends(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_destination_reported() {
        let fx = OnionFixture::new(|_, _, _| Reply::json(200, json!({})));
        let dest = fx.destination(29);
        fx.net.set_unreachable(&crate::testing::ed_key(29));

        let err = fx.transport.send(&dest, &info_request(), &SendOptions::default()).await.unwrap_err();
        match err {
            TransportError::DestinationUnreachable(key) => assert_eq!(key, crate::testing::ed_key(29)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.net.sends(), 1);
    }

    #[tokio::test]
    async fn test_failing_relay_ejected_at_threshold() {
        let fx = OnionFixture::with_config(
            TransportConfig {
                snode_failure_threshold: 1,
                retry: RetryPolicy::immediate(2),
                ..TransportConfig::default()
            },
            |_, _, _| Reply::json(200, json!({})),
        );
        let path = fx.transport.paths().get_path(&[]).await.unwrap();
        let relay = path[1].clone();
        fx.net.set_unreachable(&relay.pubkey_ed25519);

        let dest = fx.destination(29);
        let err = fx
            .transport
            .send_through_path(&path, &dest, &info_request(), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Link(LinkError::Status { code: 502, .. })));

        assert!(!fx.pool.contains(&relay.pubkey_ed25519));
        let paths = fx.transport.paths().paths_snapshot();
        assert!(!paths.iter().flatten().any(|n| *n == relay));
    }

    #[tokio::test]
    async fn test_connect_failures_flip_presence() {
        let fx = OnionFixture::new(|_, _, _| Reply::json(200, json!({})));
        fx.transport.paths().get_path(&[]).await.unwrap();
        fx.net.set_offline(true);

        let err = fx
            .transport
            .send(&fx.destination(29), &info_request(), &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Link(LinkError::Connect(_))));
        assert!(!fx.transport.presence().is_online());

        fx.net.set_offline(false);
        assert!(fx.transport.check_connectivity().await);
        assert!(fx.transport.presence().is_online());
    }

    #[tokio::test]
    async fn test_guard_failures_drop_path() {
        let fx = OnionFixture::new(|_, _, _| Reply::json(200, json!({})));
        let path = fx.transport.paths().get_path(&[]).await.unwrap();
        fx.net.set_offline(true);

        for _ in 0..3 {
            let _ = fx
                .transport
                .send_through_path(&path, &fx.destination(29), &info_request(), &SendOptions::default())
                .await;
        }
        let paths = fx.transport.paths().paths_snapshot();
        assert!(paths.iter().all(|p| p[0] != path[0]));
    }

    #[test]
    fn test_blamed_node_parsing() {
        assert_eq!(blamed_node("Next node not found: abcd"), Some("abcd"));
        assert_eq!(blamed_node("Next node is currently unreachable: ef01\n"), Some("ef01"));
        assert_eq!(blamed_node("Next node not found: "), None);
        assert_eq!(blamed_node("bad gateway"), None);
    }
}
