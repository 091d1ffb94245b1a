//! ECIES envelope crypto for queue messages.
//!
//! Every queue owns an ephemeral P-256 keypair; only the SPKI PEM public
//! half is registered with the coordinator. Payloads are sealed with a
//! one-shot ECDH exchange: an ephemeral keypair per message, HKDF-SHA256
//! key derivation, and AES-256-GCM. The wrapped format is
//! `{ephemeralPublicKey (SEC1, base64), nonce (12 bytes, base64),
//! ciphertext (base64, tag included)}`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Size of the AES-256-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// HKDF info string binding derived keys to this envelope format.
const HKDF_INFO: &[u8] = b"relay-queue-envelope-v1";

/// Errors that can occur while wrapping or unwrapping envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid wrapped payload: {0}")]
    InvalidPayload(String),
}

/// An asymmetrically wrapped payload as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedSecret {
    /// SEC1-encoded ephemeral public key, base64.
    pub ephemeral_public_key: String,
    /// 96-bit AES-GCM nonce, base64.
    pub nonce: String,
    /// Ciphertext with appended tag, base64.
    pub ciphertext: String,
}

/// Generate a fresh P-256 keypair for a queue.
pub fn generate_keypair() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// Serialize a public key as SPKI PEM, the format the coordinator stores.
pub fn public_key_to_pem(key: &PublicKey) -> Result<String, EnvelopeError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| EnvelopeError::InvalidPublicKey(e.to_string()))
}

/// Parse an SPKI PEM public key, as delivered in message envelopes.
pub fn public_key_from_pem(pem: &str) -> Result<PublicKey, EnvelopeError> {
    PublicKey::from_public_key_pem(pem)
        .map_err(|e| EnvelopeError::InvalidPublicKey(e.to_string()))
}

/// Wrap `plaintext` so that only the holder of `recipient`'s private key
/// can recover it.
pub fn wrap(plaintext: &[u8], recipient: &PublicKey) -> Result<WrappedSecret, EnvelopeError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public = ephemeral.public_key();
    let key = derive_key(ephemeral.diffie_hellman(recipient))?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| EnvelopeError::EncryptionFailed(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| EnvelopeError::EncryptionFailed(e.to_string()))?;

    Ok(WrappedSecret {
        ephemeral_public_key: BASE64.encode(ephemeral_public.to_encoded_point(false).as_bytes()),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Unwrap a payload addressed to `secret`'s public key.
pub fn unwrap(wrapped: &WrappedSecret, secret: &SecretKey) -> Result<Vec<u8>, EnvelopeError> {
    let ephemeral_bytes = BASE64
        .decode(&wrapped.ephemeral_public_key)
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;
    let ephemeral_public = PublicKey::from_sec1_bytes(&ephemeral_bytes)
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;

    let shared =
        p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral_public.as_affine());
    let key = derive_key(shared)?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| EnvelopeError::DecryptionFailed(e.to_string()))?;

    let nonce = BASE64
        .decode(&wrapped.nonce)
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;
    if nonce.len() != NONCE_SIZE {
        return Err(EnvelopeError::InvalidPayload(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    let ciphertext = BASE64
        .decode(&wrapped.ciphertext)
        .map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|e| EnvelopeError::DecryptionFailed(e.to_string()))
}

fn derive_key(shared: p256::ecdh::SharedSecret) -> Result<[u8; 32], EnvelopeError> {
    let hkdf = shared.extract::<Sha256>(None);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| EnvelopeError::EncryptionFailed(e.to_string()))?;
    Ok(key)
}
