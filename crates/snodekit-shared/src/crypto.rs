//! Per-layer sealing for onion requests.
//!
//! x25519 with an ephemeral key, a blake3 `derive_key` over the shared
//! secret, then XChaCha20-Poly1305. This schedule is not the one deployed
//! storage nodes use; it interoperates only with peers using this module.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_ONION_LAYER, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// One onion layer sealed for a single recipient.
pub struct SealedLayer {
    pub ciphertext: Vec<u8>,
    /// Ephemeral x25519 public key the recipient needs to open the layer.
    pub ephemeral_public: [u8; 32],
    /// Symmetric key shared with the recipient. The destination encrypts its
    /// reply with it.
    pub key: SymmetricKey,
}

/// Encrypt `plaintext` for the holder of `recipient` using a fresh ephemeral
/// x25519 key.
pub fn seal_for(recipient: &[u8; 32], plaintext: &[u8]) -> Result<SealedLayer, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
    let key = derive_layer_key(shared.as_bytes(), &ephemeral_public, recipient);
    let ciphertext = encrypt(&key, plaintext)?;
    Ok(SealedLayer {
        ciphertext,
        ephemeral_public,
        key,
    })
}

/// Counterpart of [`seal_for`], run by the recipient. Returns the plaintext
/// and the layer key.
pub fn open_from(
    secret: &StaticSecret,
    ephemeral_public: &[u8; 32],
    ciphertext: &[u8],
) -> Result<(Vec<u8>, SymmetricKey), CryptoError> {
    let own_public = PublicKey::from(secret).to_bytes();
    let shared = secret.diffie_hellman(&PublicKey::from(*ephemeral_public));
    let key = derive_layer_key(shared.as_bytes(), ephemeral_public, &own_public);
    let plaintext = decrypt(&key, ciphertext)?;
    Ok((plaintext, key))
}

// BLAKE3 KDF with domain separation
pub fn derive_layer_key(
    shared_secret: &[u8],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ONION_LAYER);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    hasher.update(recipient_public);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}
