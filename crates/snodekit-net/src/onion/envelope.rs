//! Onion layer framing and the v4 request/response envelopes.
//!
//! Every layer on the wire is `[u32 LE ciphertext length][ciphertext][routing JSON]`.
//! Opening a layer's ciphertext yields the same framing again, one hop
//! closer to the destination, until the destination layer reveals the v4
//! request. v4 bodies are bencoded lists of byte strings:
//!
//! ```text
//! request:  l <len>:<{"method","endpoint","headers"}> [<len>:<body>] e
//! response: l <len>:<{"code","headers"}> [<len>:<body>] e
//! ```
//!
//! Layers are sealed with [`seal_for`]: an ephemeral x25519 exchange, a
//! blake3-derived key and XChaCha20-Poly1305. That key schedule is our own
//! and does not match what deployed storage nodes expect, so these blobs
//! only open against peers built on this crate (the test network included).
//! Speaking to the live network needs its layer cipher swapped in behind
//! `seal_for`/`open_from`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use x25519_dalek::StaticSecret;

use snodekit_shared::constants::{ENC_TYPE_XCHACHA20, V4_LSRPC_TARGET};
use snodekit_shared::crypto::{open_from, seal_for, SymmetricKey};
use snodekit_shared::types::hex_key;
use snodekit_shared::Snode;

use crate::error::EnvelopeError;

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// An HTTP(S) server reached through the exit hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDestination {
    pub host: String,
    /// `https`, or `http` for servers that force plain HTTP.
    pub protocol: String,
    pub port: u16,
    pub x25519_pubkey: String,
}

/// Final recipient of an onion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Snode(Snode),
    Server(ServerDestination),
}

impl Destination {
    fn x25519(&self) -> Result<[u8; 32], EnvelopeError> {
        let key = match self {
            Destination::Snode(node) => &node.pubkey_x25519,
            Destination::Server(server) => &server.x25519_pubkey,
        };
        hex_key(key).ok_or_else(|| EnvelopeError::InvalidKey(key.clone()))
    }

    /// Routing info the exit hop uses to reach the destination.
    fn exit_routing(&self, ephemeral_key: &[u8; 32]) -> Value {
        match self {
            Destination::Snode(node) => json!({
                "destination": node.pubkey_ed25519,
                "ephemeral_key": hex::encode(ephemeral_key),
                "enc_type": ENC_TYPE_XCHACHA20,
            }),
            Destination::Server(server) => json!({
                "host": server.host,
                "target": V4_LSRPC_TARGET,
                "method": "POST",
                "protocol": server.protocol,
                "port": server.port,
                "ephemeral_key": hex::encode(ephemeral_key),
                "enc_type": ENC_TYPE_XCHACHA20,
            }),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Destination::Snode(node) => format!("snode {}", node.short()),
            Destination::Server(server) => {
                format!("{}://{}:{}", server.protocol, server.host, server.port)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Layer framing
// ---------------------------------------------------------------------------

pub fn encode_ciphertext_plus_json(ciphertext: &[u8], json: &Value) -> Result<Vec<u8>, EnvelopeError> {
    let json_bytes = serde_json::to_vec(json)?;
    let len = u32::try_from(ciphertext.len())
        .map_err(|_| EnvelopeError::Routing("ciphertext too large".to_string()))?;

    let mut out = Vec::with_capacity(4 + ciphertext.len() + json_bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(&json_bytes);
    Ok(out)
}

pub fn decode_ciphertext_plus_json(data: &[u8]) -> Result<(Vec<u8>, Value), EnvelopeError> {
    if data.len() < 4 {
        return Err(EnvelopeError::Truncated("layer length prefix"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let rest = &data[4..];
    if rest.len() < len {
        return Err(EnvelopeError::Truncated("layer ciphertext"));
    }
    let (ciphertext, json_bytes) = rest.split_at(len);
    let json = serde_json::from_slice(json_bytes)?;
    Ok((ciphertext.to_vec(), json))
}

/// A fully layered request, ready for the guard.
pub struct OnionPacket {
    pub payload: Vec<u8>,
    /// Key the destination encrypts its reply with.
    pub destination_key: SymmetricKey,
}

/// Wrap `request` (a v4 request) for `destination`, one layer per hop of
/// `path`, innermost first.
pub fn build_onion_packet(
    path: &[Snode],
    destination: &Destination,
    request: &[u8],
) -> Result<OnionPacket, EnvelopeError> {
    if path.is_empty() {
        return Err(EnvelopeError::Routing("empty path".to_string()));
    }

    // A snode can't tell a relay layer from its own, so the final layer is
    // framed too and marked by its `headers` key.
    let destination_plaintext = match destination {
        Destination::Snode(_) => encode_ciphertext_plus_json(request, &json!({ "headers": "" }))?,
        Destination::Server(_) => request.to_vec(),
    };
    let destination_layer = seal_for(&destination.x25519()?, &destination_plaintext)?;

    let mut ciphertext = destination_layer.ciphertext;
    let mut ephemeral = destination_layer.ephemeral_public;

    for (index, hop) in path.iter().enumerate().rev() {
        let routing = match path.get(index + 1) {
            None => destination.exit_routing(&ephemeral),
            Some(next) => json!({
                "destination": next.pubkey_ed25519,
                "ephemeral_key": hex::encode(ephemeral),
                "enc_type": ENC_TYPE_XCHACHA20,
            }),
        };
        let plaintext = encode_ciphertext_plus_json(&ciphertext, &routing)?;
        let hop_key = hop
            .x25519_bytes()
            .ok_or_else(|| EnvelopeError::InvalidKey(hop.pubkey_x25519.clone()))?;
        let layer = seal_for(&hop_key, &plaintext)?;
        ciphertext = layer.ciphertext;
        ephemeral = layer.ephemeral_public;
    }

    let payload = encode_ciphertext_plus_json(&ciphertext, &outer_routing(&ephemeral))?;
    Ok(OnionPacket {
        payload,
        destination_key: destination_layer.key,
    })
}

fn outer_routing(ephemeral: &[u8; 32]) -> Value {
    json!({
        "ephemeral_key": hex::encode(ephemeral),
        "enc_type": ENC_TYPE_XCHACHA20,
    })
}

/// Where a node sends what it just unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    Relay {
        destination: String,
    },
    Server {
        host: String,
        protocol: String,
        port: u16,
        target: String,
    },
    /// The unwrapped payload is the v4 request itself.
    Destination,
}

/// Result of opening one layer.
pub struct PeeledLayer {
    pub next: NextHop,
    pub inner: Vec<u8>,
    /// Key for the next layer, absent at the destination.
    pub next_ephemeral: Option<[u8; 32]>,
    /// Key the sender shares with this node.
    pub key: SymmetricKey,
}

impl PeeledLayer {
    /// Blob to forward to the next relay.
    pub fn forward_blob(&self) -> Result<Vec<u8>, EnvelopeError> {
        let ephemeral = self
            .next_ephemeral
            .ok_or_else(|| EnvelopeError::Routing("no key for next hop".to_string()))?;
        encode_ciphertext_plus_json(&self.inner, &outer_routing(&ephemeral))
    }
}

/// What a snode does with an incoming onion blob.
pub fn peel_layer(secret: &StaticSecret, blob: &[u8]) -> Result<PeeledLayer, EnvelopeError> {
    let (ciphertext, outer) = decode_ciphertext_plus_json(blob)?;
    let ephemeral = ephemeral_from(&outer)?
        .ok_or_else(|| EnvelopeError::Routing("missing ephemeral_key".to_string()))?;
    let (plaintext, key) = open_from(secret, &ephemeral, &ciphertext)?;
    let (inner, routing) = decode_ciphertext_plus_json(&plaintext)?;

    let next = if let Some(destination) = routing.get("destination").and_then(Value::as_str) {
        NextHop::Relay {
            destination: destination.to_string(),
        }
    } else if let Some(host) = routing.get("host").and_then(Value::as_str) {
        NextHop::Server {
            host: host.to_string(),
            protocol: str_field(&routing, "protocol").unwrap_or("https").to_string(),
            port: routing
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(443),
            target: str_field(&routing, "target").unwrap_or(V4_LSRPC_TARGET).to_string(),
        }
    } else if routing.get("headers").is_some() {
        NextHop::Destination
    } else {
        return Err(EnvelopeError::Routing(routing.to_string()));
    };

    Ok(PeeledLayer {
        next,
        inner,
        next_ephemeral: ephemeral_from(&routing)?,
        key,
    })
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn ephemeral_from(routing: &Value) -> Result<Option<[u8; 32]>, EnvelopeError> {
    match str_field(routing, "ephemeral_key") {
        None => Ok(None),
        Some(hex_str) => hex_key(hex_str)
            .map(Some)
            .ok_or_else(|| EnvelopeError::InvalidKey(hex_str.to_string())),
    }
}

// ---------------------------------------------------------------------------
// v4 bodies
// ---------------------------------------------------------------------------

/// Metadata part of a v4 request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V4RequestInfo {
    pub method: String,
    /// Path plus query string.
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn push_bstring(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Read one `<len>:<bytes>` starting at `pos`; returns the bytes and the
/// position after them.
fn read_bstring(data: &[u8], pos: usize) -> Result<(&[u8], usize), EnvelopeError> {
    let colon = data[pos..]
        .iter()
        .position(|b| *b == b':')
        .map(|offset| pos + offset)
        .ok_or(EnvelopeError::Truncated("bencoded length"))?;

    let digits = &data[pos..colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(EnvelopeError::NotV4("bad string length".to_string()));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EnvelopeError::NotV4("bad string length".to_string()))?;

    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or(EnvelopeError::Truncated("bencoded string"))?;
    Ok((&data[start..end], end))
}

/// Split a v4 list into its metadata and optional body.
fn decode_v4_parts(data: &[u8]) -> Result<(&[u8], Option<&[u8]>), EnvelopeError> {
    if data.len() < 2 || data[0] != b'l' || data[data.len() - 1] != b'e' {
        return Err(EnvelopeError::NotV4("missing list delimiters".to_string()));
    }
    let end = data.len() - 1;
    let (meta, pos) = read_bstring(&data[..end], 1)?;
    if pos == end {
        return Ok((meta, None));
    }
    let (body, pos) = read_bstring(&data[..end], pos)?;
    if pos != end {
        return Err(EnvelopeError::NotV4("trailing data".to_string()));
    }
    Ok((meta, Some(body)))
}

pub fn encode_v4_request(info: &V4RequestInfo, body: Option<&[u8]>) -> Result<Vec<u8>, EnvelopeError> {
    let meta = serde_json::to_vec(info)?;
    let mut out = vec![b'l'];
    push_bstring(&mut out, &meta);
    if let Some(body) = body {
        push_bstring(&mut out, body);
    }
    out.push(b'e');
    Ok(out)
}

pub fn decode_v4_request(data: &[u8]) -> Result<(V4RequestInfo, Option<Vec<u8>>), EnvelopeError> {
    let (meta, body) = decode_v4_parts(data)?;
    let info = serde_json::from_slice(meta)?;
    Ok((info, body.map(<[u8]>::to_vec)))
}

pub fn encode_v4_response(
    code: u16,
    headers: &BTreeMap<String, String>,
    body: Option<&[u8]>,
) -> Result<Vec<u8>, EnvelopeError> {
    let meta = serde_json::to_vec(&json!({ "code": code, "headers": headers }))?;
    let mut out = vec![b'l'];
    push_bstring(&mut out, &meta);
    if let Some(body) = body {
        push_bstring(&mut out, body);
    }
    out.push(b'e');
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub enum V4Body {
    Empty,
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl V4Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            V4Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            V4Body::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A decoded v4 response.
#[derive(Debug, Clone, PartialEq)]
pub struct V4Response {
    pub code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: V4Body,
    /// The body exactly as received.
    pub body_bytes: Vec<u8>,
}

#[derive(Deserialize)]
struct V4ResponseMeta {
    code: u16,
    #[serde(default)]
    headers: serde_json::Map<String, Value>,
}

pub fn decode_v4_response(data: &[u8]) -> Result<V4Response, EnvelopeError> {
    let (meta, body) = decode_v4_parts(data)?;
    let meta: V4ResponseMeta = serde_json::from_slice(meta)?;

    let headers: BTreeMap<String, String> = meta
        .headers
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (name.to_ascii_lowercase(), value)
        })
        .collect();

    let body_bytes = body.map(<[u8]>::to_vec).unwrap_or_default();
    let is_json = headers
        .get("content-type")
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);

    let body = if body_bytes.is_empty() {
        V4Body::Empty
    } else if let Ok(value) = serde_json::from_slice::<Value>(&body_bytes) {
        V4Body::Json(value)
    } else if is_json {
        return Err(EnvelopeError::NotV4("body is not valid JSON".to_string()));
    } else if let Ok(text) = std::str::from_utf8(&body_bytes) {
        V4Body::Text(text.to_string())
    } else {
        V4Body::Binary(body_bytes.clone())
    };

    Ok(V4Response {
        code: meta.code,
        headers,
        body,
        body_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use snodekit_shared::crypto::{decrypt, encrypt};
    use x25519_dalek::PublicKey;

    fn keyed_node(i: u8) -> (Snode, StaticSecret) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let node = Snode {
            ip: format!("10.{i}.0.1"),
            port: 22021,
            pubkey_x25519: hex::encode(PublicKey::from(&secret).to_bytes()),
            pubkey_ed25519: format!("{:064x}", i),
            storage_server_version: vec![2, 8, 0],
        };
        (node, secret)
    }

    fn request() -> Vec<u8> {
        let info = V4RequestInfo {
            method: "POST".to_string(),
            endpoint: "/storage_rpc/v1?x=1".to_string(),
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
        };
        encode_v4_request(&info, Some(br#"{"method":"info"}"#)).unwrap()
    }

    #[test]
    fn test_layer_framing_roundtrip() {
        let json = json!({ "destination": "abc" });
        let encoded = encode_ciphertext_plus_json(b"cipher", &json).unwrap();
        assert_eq!(&encoded[..4], &6u32.to_le_bytes());
        let (ct, back) = decode_ciphertext_plus_json(&encoded).unwrap();
        assert_eq!(ct, b"cipher");
        assert_eq!(back, json);
    }

    #[test]
    fn test_truncated_layer_rejected() {
        assert!(decode_ciphertext_plus_json(&[1, 0]).is_err());
        let mut encoded = encode_ciphertext_plus_json(b"cipher", &json!({})).unwrap();
        encoded[0] = 200;
        assert!(decode_ciphertext_plus_json(&encoded).is_err());
    }

    #[test]
    fn test_onion_roundtrip_through_each_hop() {
        for hops in 1..=3u8 {
            let nodes: Vec<(Snode, StaticSecret)> = (0..hops).map(keyed_node).collect();
            let path: Vec<Snode> = nodes.iter().map(|(n, _)| n.clone()).collect();
            let (dest_node, dest_secret) = keyed_node(50);
            let destination = Destination::Snode(dest_node.clone());

            let packet = build_onion_packet(&path, &destination, &request()).unwrap();

            let mut blob = packet.payload;
            for (index, (_, secret)) in nodes.iter().enumerate() {
                let peeled = peel_layer(secret, &blob).unwrap();
                let expected = match path.get(index + 1) {
                    Some(next) => next.pubkey_ed25519.clone(),
                    None => dest_node.pubkey_ed25519.clone(),
                };
                assert_eq!(peeled.next, NextHop::Relay { destination: expected });
                blob = peeled.forward_blob().unwrap();
            }

            let last = peel_layer(&dest_secret, &blob).unwrap();
            assert_eq!(last.next, NextHop::Destination);
            assert_eq!(last.inner, request());
            assert_eq!(last.key, packet.destination_key, "hops = {hops}");
        }
    }

    #[test]
    fn test_server_destination_routing() {
        let (guard, guard_secret) = keyed_node(1);
        let server_secret = StaticSecret::random_from_rng(OsRng);
        let destination = Destination::Server(ServerDestination {
            host: "open.example.org".to_string(),
            protocol: "http".to_string(),
            port: 80,
            x25519_pubkey: hex::encode(PublicKey::from(&server_secret).to_bytes()),
        });

        let packet = build_onion_packet(&[guard], &destination, &request()).unwrap();
        let peeled = peel_layer(&guard_secret, &packet.payload).unwrap();
        assert_eq!(
            peeled.next,
            NextHop::Server {
                host: "open.example.org".to_string(),
                protocol: "http".to_string(),
                port: 80,
                target: V4_LSRPC_TARGET.to_string(),
            }
        );

        let ephemeral = peeled.next_ephemeral.unwrap();
        let (plain, key) = open_from(&server_secret, &ephemeral, &peeled.inner).unwrap();
        assert_eq!(plain, request());

        // the reply travels back under the destination key
        let reply = encrypt(&key, b"reply").unwrap();
        assert_eq!(decrypt(&packet.destination_key, &reply).unwrap(), b"reply");
    }

    #[test]
    fn test_wrong_hop_cannot_peel() {
        let (guard, _) = keyed_node(1);
        let (_, other_secret) = keyed_node(2);
        let (dest, _) = keyed_node(3);
        let packet = build_onion_packet(&[guard], &Destination::Snode(dest), b"x").unwrap();
        assert!(peel_layer(&other_secret, &packet.payload).is_err());
    }

    #[test]
    fn test_v4_request_roundtrip() {
        let (info, body) = decode_v4_request(&request()).unwrap();
        assert_eq!(info.endpoint, "/storage_rpc/v1?x=1");
        assert_eq!(body.as_deref(), Some(br#"{"method":"info"}"#.as_slice()));

        let no_body = encode_v4_request(&info, None).unwrap();
        assert_eq!(decode_v4_request(&no_body).unwrap().1, None);
    }

    #[test]
    fn test_v4_response_known_bytes() {
        let raw = br#"l12:{"code":200}e"#;
        let response = decode_v4_response(raw).unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.body, V4Body::Empty);

        let raw = br#"l44:{"code":200,"headers":{"content-length":11}}11:{"ok":true}e"#;
        let response = decode_v4_response(raw).unwrap();
        assert_eq!(response.headers.get("content-length").map(String::as_str), Some("11"));
        assert_eq!(response.body, V4Body::Json(json!({ "ok": true })));
    }

    #[test]
    fn test_v4_response_text_and_binary() {
        let text = encode_v4_response(400, &BTreeMap::new(), Some(b"plain words")).unwrap();
        let response = decode_v4_response(&text).unwrap();
        assert_eq!(response.code, 400);
        assert_eq!(response.body.as_text(), Some("plain words"));

        let binary = encode_v4_response(200, &BTreeMap::new(), Some(&[0xff, 0x00, 0xfe])).unwrap();
        let response = decode_v4_response(&binary).unwrap();
        assert_eq!(response.body, V4Body::Binary(vec![0xff, 0x00, 0xfe]));
        assert_eq!(response.body_bytes, vec![0xff, 0x00, 0xfe]);
    }

    #[test]
    fn test_v4_response_rejects_garbage() {
        assert!(decode_v4_response(b"").is_err());
        assert!(decode_v4_response(b"d3:abce").is_err());
        assert!(decode_v4_response(b"l99:{}e").is_err());
        assert!(decode_v4_response(br#"l16:{"code":200}e"#).is_err());
        let headers = BTreeMap::from([("content-type".to_string(), "application/json".to_string())]);
        let bad_json = encode_v4_response(200, &headers, Some(b"{nope")).unwrap();
        assert!(decode_v4_response(&bad_json).is_err());
    }
}
