//! Shared AES-256-GCM primitives.
//!
//! Used by [`crate::envelope`] (end-to-end payloads under the ECDH secret)
//! and by the relay channel (whole envelopes sealed under the session
//! secret before they reach the relay server).
//!
//! # Relay sealed format
//!
//! The relay wire format concatenates the parts in the order the wallet
//! apps expect, then hex encodes the result:
//!
//! ```text
//! iv (12 bytes) ‖ auth tag (16 bytes) ‖ ciphertext
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::error::{LinkError, Result};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Draw a fresh random nonce.
#[must_use]
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt under `key` with the given nonce. Output is `ciphertext ‖ tag`.
pub fn encrypt(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| LinkError::CryptoUnavailable(format!("Encryption failed: {e}")))
}

/// Decrypt `ciphertext ‖ tag` under `key`.
pub fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(LinkError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| LinkError::DecryptionFailed)
}

/// Seal `plaintext` in the relay hex layout `iv ‖ tag ‖ ciphertext`.
pub fn seal_hex(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let nonce = random_nonce();
    let sealed = encrypt(key, &nonce, plaintext)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(data_encoding::HEXLOWER.encode(&out))
}

/// Open a relay hex payload produced by [`seal_hex`] (or a wallet app).
pub fn open_hex(key: &[u8; 32], sealed_hex: &str) -> Result<Vec<u8>> {
    let bytes = data_encoding::HEXLOWER_PERMISSIVE
        .decode(sealed_hex.as_bytes())
        .map_err(|_| LinkError::DecryptionFailed)?;
    if bytes.len() < NONCE_SIZE + TAG_SIZE {
        return Err(LinkError::DecryptionFailed);
    }
    let (nonce, rest) = bytes.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let mut joined = Vec::with_capacity(rest.len());
    joined.extend_from_slice(ciphertext);
    joined.extend_from_slice(tag);
    decrypt(key, nonce, &joined)
}
