use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::namespaces::Namespace;
use crate::types::STANDARD_PREFIX;

/// The account's ed25519 identity. Storage requests for our own swarm are
/// signed with it, and the account id is derived from it.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// Serializable format for storing the identity on disk
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

/// Signature fields attached to an authenticated storage request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub pubkey_ed25519: String,
    /// base64 ed25519 signature
    pub signature: String,
    pub timestamp: i64,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// `05` followed by the x25519 form of our ed25519 key. This is the
    /// pubkey our swarm is keyed by.
    pub fn account_id(&self) -> String {
        let montgomery = self.signing_key.verifying_key().to_montgomery();
        format!("{}{}", STANDARD_PREFIX, hex::encode(montgomery.to_bytes()))
    }

    pub fn ed25519_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a retrieve for `namespace` at `timestamp_ms`.
    pub fn sign_retrieve(&self, namespace: Namespace, timestamp_ms: i64) -> SignedRequest {
        let message = retrieve_signature_message(namespace, timestamp_ms);
        let signature = self.sign(message.as_bytes());
        SignedRequest {
            pubkey_ed25519: self.ed25519_hex(),
            signature: STANDARD.encode(signature.to_bytes()),
            timestamp: timestamp_ms,
        }
    }

    /// Sign an `expire` of `hashes` to `expiry_ms`. The timestamp field
    /// carries the expiry.
    pub fn sign_expire(&self, extend: bool, expiry_ms: i64, hashes: &[String]) -> SignedRequest {
        let message = expire_signature_message(extend, expiry_ms, hashes);
        let signature = self.sign(message.as_bytes());
        SignedRequest {
            pubkey_ed25519: self.ed25519_hex(),
            signature: STANDARD.encode(signature.to_bytes()),
            timestamp: expiry_ms,
        }
    }
}

/// `retrieve` + namespace (left out for the default namespace) + timestamp.
pub fn retrieve_signature_message(namespace: Namespace, timestamp_ms: i64) -> String {
    match namespace {
        Namespace::Default => format!("retrieve{timestamp_ms}"),
        other => format!("retrieve{}{timestamp_ms}", other.id()),
    }
}

/// `expire` + `extend` (when only extending) + expiry + every hash in order.
pub fn expire_signature_message(extend: bool, expiry_ms: i64, hashes: &[String]) -> String {
    let mode = if extend { "extend" } else { "" };
    format!("expire{mode}{expiry_ms}{}", hashes.concat())
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
