//! Storage RPC against individual snodes, always through an onion path.
//!
//! Every call is a JSON body posted to the snode's `/storage_rpc/v1`. The
//! destination's status codes come back to this layer untouched so `421`
//! (wrong swarm) can be told apart from plain failures.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use snodekit_shared::constants::{CONFIG_MESSAGE_TTL_MS, STORAGE_RPC_ENDPOINT, UNROUTABLE_IP};
use snodekit_shared::{short_key, Identity, Namespace, Snode};

use crate::error::{PoolError, SnodeApiError};
use crate::network_time::NetworkTime;
use crate::node_pool::ConsensusSource;
use crate::onion::envelope::Destination;
use crate::onion::transport::{OnionRequest, OnionRequestTransport, SendOptions};
use crate::seed::{parse_service_node_states, service_nodes_params};

/// Swarm of a pubkey as one snode reports it.
#[async_trait]
pub trait SwarmSource: Send + Sync {
    async fn fetch_swarm(&self, target: &Snode, pubkey: &str) -> Result<Vec<Snode>, SnodeApiError>;
}

/// Signature fields for a retrieve. `None` sends the retrieve unsigned.
#[async_trait]
pub trait RetrieveAuth: Send + Sync {
    async fn retrieve_params(
        &self,
        pubkey: &str,
        namespace: Namespace,
        timestamp_ms: i64,
    ) -> anyhow::Result<Option<Map<String, Value>>>;

    /// Signature fields for extending the expiry of `hashes` in the swarm of
    /// `pubkey`. `None` leaves their expiry alone.
    async fn expire_params(
        &self,
        _pubkey: &str,
        _hashes: &[String],
        _expiry_ms: i64,
    ) -> anyhow::Result<Option<Map<String, Value>>> {
        Ok(None)
    }
}

/// Signs retrieves of our own swarm with the account key. Other swarms are
/// read unsigned.
pub struct IdentityAuth {
    identity: Identity,
    account_id: String,
}

impl IdentityAuth {
    pub fn new(identity: Identity) -> Self {
        let account_id = identity.account_id();
        Self {
            identity,
            account_id,
        }
    }
}

#[async_trait]
impl RetrieveAuth for IdentityAuth {
    async fn retrieve_params(
        &self,
        pubkey: &str,
        namespace: Namespace,
        timestamp_ms: i64,
    ) -> anyhow::Result<Option<Map<String, Value>>> {
        if pubkey != self.account_id {
            return Ok(None);
        }
        let signed = self.identity.sign_retrieve(namespace, timestamp_ms);
        match serde_json::to_value(signed)? {
            Value::Object(params) => Ok(Some(params)),
            _ => anyhow::bail!("signed request did not serialize to an object"),
        }
    }

    async fn expire_params(
        &self,
        pubkey: &str,
        hashes: &[String],
        expiry_ms: i64,
    ) -> anyhow::Result<Option<Map<String, Value>>> {
        if pubkey != self.account_id {
            return Ok(None);
        }
        let signed = self.identity.sign_expire(true, expiry_ms, hashes);
        let mut params = Map::new();
        params.insert("pubkey_ed25519".to_string(), json!(signed.pubkey_ed25519));
        params.insert("signature".to_string(), json!(signed.signature));
        Ok(Some(params))
    }
}

/// One namespace to retrieve, from `last_hash` on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub namespace: Namespace,
    pub last_hash: Option<String>,
}

/// A stored message as returned by `retrieve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveItem {
    pub hash: String,
    /// base64
    pub data: String,
    pub expiration: i64,
    /// When the snode stored it.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveResult {
    pub namespace: Namespace,
    pub code: u16,
    pub messages: Vec<RetrieveItem>,
    pub more: bool,
}

#[async_trait]
pub trait SnodeRetriever: Send + Sync {
    /// Retrieve every request from `target` in one `sequence` call. Results
    /// come back in retrieval order (keys last).
    ///
    /// A non-empty `bump_hashes` also extends the expiry of those messages
    /// in the same call, when `auth` can sign for it.
    async fn retrieve(
        &self,
        target: &Snode,
        pubkey: &str,
        requests: &[RetrieveRequest],
        bump_hashes: &[String],
        auth: &dyn RetrieveAuth,
    ) -> Result<Vec<RetrieveResult>, SnodeApiError>;
}

pub struct SnodeApi {
    transport: Arc<OnionRequestTransport>,
    time: Arc<NetworkTime>,
}

impl SnodeApi {
    pub fn new(transport: Arc<OnionRequestTransport>, time: Arc<NetworkTime>) -> Self {
        Self { transport, time }
    }

    pub fn time(&self) -> &Arc<NetworkTime> {
        &self.time
    }

    /// One storage RPC. Returns the JSON body of a 2xx reply.
    pub async fn rpc(
        &self,
        target: &Snode,
        method: &str,
        params: Value,
        associated_with: Option<&str>,
    ) -> Result<Value, SnodeApiError> {
        let body = json!({ "method": method, "params": params });
        let options = SendOptions {
            associated_with: associated_with.map(str::to_string),
            ..SendOptions::allowing_error_codes()
        };
        let response = self
            .transport
            .send(
                &Destination::Snode(target.clone()),
                &OnionRequest::post_json(STORAGE_RPC_ENDPOINT, &body),
                &options,
            )
            .await?;

        match response.code {
            200..=299 => response
                .body
                .as_json()
                .cloned()
                .ok_or_else(|| SnodeApiError::InvalidResponse(format!("{method}: body is not JSON"))),
            421 => Err(wrong_swarm(target, response.body.as_json())),
            code => {
                debug!(node = %target.short(), method, code, "storage rpc failed");
                Err(SnodeApiError::Status(code))
            }
        }
    }

    /// Run `requests` in order on `target`; one `{code, body}` per request.
    pub async fn sequence(
        &self,
        target: &Snode,
        requests: Vec<Value>,
        associated_with: Option<&str>,
    ) -> Result<Vec<(u16, Value)>, SnodeApiError> {
        let expected = requests.len();
        let body = self
            .rpc(target, "sequence", json!({ "requests": requests }), associated_with)
            .await?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| SnodeApiError::InvalidResponse("sequence without results".to_string()))?;
        if results.len() != expected {
            return Err(SnodeApiError::InvalidResponse(format!(
                "sequence returned {} results for {expected} requests",
                results.len()
            )));
        }

        results
            .iter()
            .map(|result| {
                let code = result
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .ok_or_else(|| SnodeApiError::InvalidResponse("sub-result without code".to_string()))?;
                Ok((code, result.get("body").cloned().unwrap_or(Value::Null)))
            })
            .collect()
    }

    /// Full service node list as `target` sees it.
    pub async fn get_service_nodes(&self, target: &Snode) -> Result<Vec<Snode>, SnodeApiError> {
        let params = json!({
            "endpoint": "get_service_nodes",
            "params": service_nodes_params(),
        });
        let body = self.rpc(target, "oxend_request", params, None).await?;
        let result = body
            .get("result")
            .ok_or_else(|| SnodeApiError::InvalidResponse("oxend_request without result".to_string()))?;
        parse_service_node_states(result).map_err(|e| SnodeApiError::InvalidResponse(e.to_string()))
    }

    pub async fn get_swarm(&self, target: &Snode, pubkey: &str) -> Result<Vec<Snode>, SnodeApiError> {
        let body = self
            .rpc(target, "get_swarm", json!({ "pubkey": pubkey }), Some(pubkey))
            .await?;
        if let Some(t) = body.get("t").and_then(Value::as_i64) {
            self.time.handle_offset_from_network("get_swarm", t);
        }
        let snodes = body
            .get("snodes")
            .and_then(Value::as_array)
            .ok_or_else(|| SnodeApiError::InvalidResponse("get_swarm without snodes".to_string()))?;

        let swarm: Vec<Snode> = snodes.iter().filter_map(parse_swarm_entry).collect();
        debug!(pubkey = %short_key(pubkey), size = swarm.len(), "swarm fetched");
        Ok(swarm)
    }
}

#[async_trait]
impl ConsensusSource for SnodeApi {
    async fn fetch_pool_from_snode(&self, target: &Snode) -> Result<Vec<Snode>, PoolError> {
        self.get_service_nodes(target)
            .await
            .map_err(|e| PoolError::Consensus(format!("{}: {e}", target.short())))
    }
}

#[async_trait]
impl SwarmSource for SnodeApi {
    async fn fetch_swarm(&self, target: &Snode, pubkey: &str) -> Result<Vec<Snode>, SnodeApiError> {
        self.get_swarm(target, pubkey).await
    }
}

#[async_trait]
impl SnodeRetriever for SnodeApi {
    async fn retrieve(
        &self,
        target: &Snode,
        pubkey: &str,
        requests: &[RetrieveRequest],
        bump_hashes: &[String],
        auth: &dyn RetrieveAuth,
    ) -> Result<Vec<RetrieveResult>, SnodeApiError> {
        let mut ordered = requests.to_vec();
        ordered.sort_by_key(|r| r.namespace.retrieval_stage());

        let timestamp = self.time.now_ms();
        let mut subrequests = Vec::with_capacity(ordered.len());
        for request in &ordered {
            let mut params = Map::new();
            params.insert("pubkey".to_string(), json!(pubkey));
            params.insert("namespace".to_string(), json!(request.namespace.id()));
            params.insert(
                "last_hash".to_string(),
                json!(request.last_hash.as_deref().unwrap_or_default()),
            );
            let signed = auth
                .retrieve_params(pubkey, request.namespace, timestamp)
                .await
                .map_err(|e| SnodeApiError::Auth(e.to_string()))?;
            if let Some(signed) = signed {
                params.extend(signed);
            }
            subrequests.push(json!({ "method": "retrieve", "params": params }));
        }
        if let Some(expire) = expire_subrequest(pubkey, bump_hashes, timestamp, auth).await {
            subrequests.push(expire);
        }

        let mut results = self.sequence(target, subrequests, Some(pubkey)).await?;
        if results.len() > ordered.len() {
            if let Some((code, _)) = results.pop() {
                if code != 200 {
                    debug!(node = %target.short(), code, "config expiry bump failed");
                }
            }
        }

        let mut out = Vec::with_capacity(results.len());
        for (request, (code, body)) in ordered.iter().zip(results) {
            if code == 421 {
                return Err(wrong_swarm(target, Some(&body)));
            }
            if let Some(t) = body.get("t").and_then(Value::as_i64) {
                self.time.handle_offset_from_network("retrieve", t);
            }
            let messages = if code == 200 {
                parse_items(&body, target, request.namespace)
            } else {
                debug!(node = %target.short(), namespace = %request.namespace, code, "retrieve sub-request failed");
                Vec::new()
            };
            out.push(RetrieveResult {
                namespace: request.namespace,
                code,
                messages,
                more: body.get("more").and_then(Value::as_bool).unwrap_or(false),
            });
        }
        Ok(out)
    }
}

/// `expire` with `extend` set, pushing `hashes` out to a full config TTL.
/// Signing failures skip the bump without failing the retrieve.
async fn expire_subrequest(
    pubkey: &str,
    hashes: &[String],
    now_ms: i64,
    auth: &dyn RetrieveAuth,
) -> Option<Value> {
    if hashes.is_empty() {
        return None;
    }
    let expiry = now_ms + CONFIG_MESSAGE_TTL_MS;
    let signed = match auth.expire_params(pubkey, hashes, expiry).await {
        Ok(Some(signed)) => signed,
        Ok(None) => {
            debug!(pubkey = %short_key(pubkey), "no signature for config expiry bump");
            return None;
        }
        Err(e) => {
            warn!(pubkey = %short_key(pubkey), error = %e, "could not sign config expiry bump");
            return None;
        }
    };
    let mut params = Map::new();
    params.insert("pubkey".to_string(), json!(pubkey));
    params.insert("messages".to_string(), json!(hashes));
    params.insert("expiry".to_string(), json!(expiry));
    params.insert("extend".to_string(), json!(true));
    params.extend(signed);
    Some(json!({ "method": "expire", "params": params }))
}

fn parse_items(body: &Value, target: &Snode, namespace: Namespace) -> Vec<RetrieveItem> {
    let Some(items) = body.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    let valid: Vec<RetrieveItem> = items.iter().filter_map(parse_item).collect();
    if valid.len() < items.len() {
        warn!(
            node = %target.short(),
            %namespace,
            dropped = items.len() - valid.len(),
            "dropping malformed retrieved items"
        );
    }
    valid
}

fn parse_item(item: &Value) -> Option<RetrieveItem> {
    let hash = item.get("hash")?.as_str()?;
    let data = item.get("data")?.as_str()?;
    STANDARD.decode(data).ok()?;
    let expiration = finite_millis(item.get("expiration")?)?;
    let timestamp = finite_millis(item.get("timestamp")?).filter(|t| *t > 0)?;
    Some(RetrieveItem {
        hash: hash.to_string(),
        data: data.to_string(),
        expiration,
        timestamp,
    })
}

fn finite_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// A `get_swarm` entry. Ports arrive as strings or numbers.
fn parse_swarm_entry(entry: &Value) -> Option<Snode> {
    let ip = entry.get("ip")?.as_str()?;
    if ip == UNROUTABLE_IP {
        return None;
    }
    let port = ["port_https", "port"]
        .iter()
        .filter_map(|field| entry.get(*field))
        .find_map(|port| match port {
            Value::String(s) => s.parse::<u16>().ok(),
            other => other.as_u64().and_then(|p| u16::try_from(p).ok()),
        })?;
    Some(Snode {
        ip: ip.to_string(),
        port,
        pubkey_x25519: entry.get("pubkey_x25519")?.as_str()?.to_string(),
        pubkey_ed25519: entry.get("pubkey_ed25519")?.as_str()?.to_string(),
        storage_server_version: Vec::new(),
    })
}

fn wrong_swarm(target: &Snode, body: Option<&Value>) -> SnodeApiError {
    let replacement = body
        .and_then(|b| b.get("snodes"))
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(parse_swarm_entry).collect())
        .unwrap_or_default();
    SnodeApiError::WrongSwarm {
        snode: target.pubkey_ed25519.clone(),
        replacement,
    }
}
