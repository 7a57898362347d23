//! P-256 ECDH key exchange between the dapp and a wallet surface.
//!
//! Each side generates a [`KeyPair`], sends its public key (SPKI DER, hex)
//! in the `sender` field of every envelope, and derives the same
//! [`SharedSecret`] from its own private key and the peer's public key.
//! The raw ECDH x-coordinate is used directly as the AES-256-GCM key,
//! which is what WebCrypto's `deriveKey({name: "ECDH"}, …, {name:
//! "AES-GCM", length: 256})` produces on the browser side.

// Rust guideline compliant 2026-02

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{LinkError, Result};

/// Attempts at drawing a valid scalar before giving up (a random 256-bit
/// value is out of range with probability ~2^-32).
const MAX_SCALAR_ATTEMPTS: usize = 4;

/// Own asymmetric key pair. The private half never leaves the process.
#[derive(Clone)]
pub struct KeyPair {
    private_key: SecretKey,
    public_key: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &export_public_key_hex(&self.public_key))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG.
    ///
    /// Fails with `CryptoUnavailable` if the platform cannot supply randomness.
    pub fn generate() -> Result<Self> {
        for _ in 0..MAX_SCALAR_ATTEMPTS {
            let mut bytes = Zeroizing::new([0u8; 32]);
            OsRng
                .try_fill_bytes(&mut bytes[..])
                .map_err(|e| LinkError::CryptoUnavailable(format!("OS RNG failed: {e}")))?;
            if let Ok(private_key) = SecretKey::from_slice(&bytes[..]) {
                let public_key = private_key.public_key();
                return Ok(Self {
                    private_key,
                    public_key,
                });
            }
        }
        Err(LinkError::CryptoUnavailable(
            "could not draw a valid P-256 scalar".into(),
        ))
    }

    /// Rebuild a pair from a persisted PKCS#8 DER (hex) private key.
    pub fn from_private_key_hex(hex: &str) -> Result<Self> {
        let der = decode_hex(hex)?;
        let private_key = SecretKey::from_pkcs8_der(&der)
            .map_err(|e| LinkError::InvalidKeyEncoding(format!("private key: {e}")))?;
        let public_key = private_key.public_key();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// PKCS#8 DER (hex) encoding of the private key, for the local key store only.
    pub fn private_key_hex(&self) -> Result<Zeroizing<String>> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| LinkError::CryptoUnavailable(format!("PKCS#8 encoding failed: {e}")))?;
        Ok(Zeroizing::new(data_encoding::HEXLOWER.encode(der.as_bytes())))
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Hex SPKI encoding of the public half, as placed in envelope `sender`.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        export_public_key_hex(&self.public_key)
    }

    /// Derive the secret shared with `peer`.
    #[must_use]
    pub fn derive_shared_secret(&self, peer: &PublicKey) -> SharedSecret {
        derive_shared_secret(&self.private_key, peer)
    }
}

/// Symmetric key material both endpoints derive independently.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

impl SharedSecret {
    /// Wrap raw key bytes (e.g. a session secret used as a sealing key).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw AES-256 key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// ECDH(own private, peer public) → 32-byte shared secret.
#[must_use]
pub fn derive_shared_secret(own_private: &SecretKey, peer_public: &PublicKey) -> SharedSecret {
    let shared = diffie_hellman(own_private.to_nonzero_scalar(), peer_public.as_affine());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());
    SharedSecret(bytes)
}

/// Decode and validate a peer public key.
///
/// Accepts SPKI DER (browser `exportKey("spki")`) or a raw SEC1 point.
pub fn import_peer_public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_public_key_der(bytes)
        .or_else(|_| PublicKey::from_sec1_bytes(bytes))
        .map_err(|e| LinkError::InvalidKeyEncoding(format!("public key: {e}")))
}

/// [`import_peer_public_key`] over the hex wire form.
pub fn import_public_key_hex(hex: &str) -> Result<PublicKey> {
    import_peer_public_key(&decode_hex(hex)?)
}

/// SPKI DER encoding of a public key.
#[must_use]
pub fn export_public_key(key: &PublicKey) -> Vec<u8> {
    match key.to_public_key_der() {
        Ok(doc) => doc.as_bytes().to_vec(),
        // Encoding a valid point cannot fail; fall back to SEC1 regardless.
        Err(_) => key.to_sec1_bytes().to_vec(),
    }
}

/// Hex form of [`export_public_key`].
#[must_use]
pub fn export_public_key_hex(key: &PublicKey) -> String {
    data_encoding::HEXLOWER.encode(&export_public_key(key))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    data_encoding::HEXLOWER_PERMISSIVE
        .decode(hex.trim_start_matches("0x").as_bytes())
        .map_err(|e| LinkError::InvalidKeyEncoding(format!("hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_secret() {
        for _ in 0..8 {
            let dapp = KeyPair::generate().unwrap();
            let wallet = KeyPair::generate().unwrap();

            let a = dapp.derive_shared_secret(wallet.public_key());
            let b = wallet.derive_shared_secret(dapp.public_key());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_different_peers_derive_different_secrets() {
        let dapp = KeyPair::generate().unwrap();
        let w1 = KeyPair::generate().unwrap();
        let w2 = KeyPair::generate().unwrap();

        assert_ne!(
            dapp.derive_shared_secret(w1.public_key()),
            dapp.derive_shared_secret(w2.public_key())
        );
    }

    #[test]
    fn test_public_key_hex_round_trip() {
        let pair = KeyPair::generate().unwrap();
        let imported = import_public_key_hex(&pair.public_key_hex()).unwrap();
        assert_eq!(&imported, pair.public_key());
    }

    #[test]
    fn test_import_accepts_sec1_points() {
        let pair = KeyPair::generate().unwrap();
        let sec1 = pair.public_key().to_sec1_bytes();
        assert_eq!(&import_peer_public_key(&sec1).unwrap(), pair.public_key());
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(matches!(
            import_peer_public_key(b"definitely not a key"),
            Err(LinkError::InvalidKeyEncoding(_))
        ));
        assert!(matches!(
            import_public_key_hex("zz"),
            Err(LinkError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn test_private_key_round_trip() {
        let pair = KeyPair::generate().unwrap();
        let restored = KeyPair::from_private_key_hex(&pair.private_key_hex().unwrap()).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
    }

    #[test]
    fn test_debug_omits_private_key() {
        let pair = KeyPair::generate().unwrap();
        let private_hex = pair.private_key_hex().unwrap();
        assert!(!format!("{pair:?}").contains(private_hex.as_str()));
        assert_eq!(
            format!("{:?}", pair.derive_shared_secret(pair.public_key())),
            "SharedSecret(..)"
        );
    }
}
