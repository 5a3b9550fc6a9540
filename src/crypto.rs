//! End-to-end protection of CONNECT payloads.
//!
//! The two peers share a 32-byte secret configured out of band. Only the
//! CONNECT payload is sealed: it is the one place the tunnel names a target
//! host, and everything else is reachable to the carrier operator anyway.
//! Format on the wire: random 96-bit nonce followed by the AES-256-GCM
//! ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("secret must be {KEY_LEN} hex-encoded bytes")]
    InvalidKey,
    #[error("ciphertext is malformed")]
    Malformed,
}

/// Parse a hex secret into key material, insisting on exactly 32 bytes.
pub fn hex_to_key(s: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKey)?;

    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}

/// Generate a fresh hex secret for the `--secret` CLI flag.
pub fn generate_secret() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);

    hex::encode(key)
}

pub fn encrypt(data: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), data)
        .map_err(|_| CryptoError::Malformed)?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);

    Ok(out)
}

pub fn decrypt(data: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Malformed);
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Malformed)
}
