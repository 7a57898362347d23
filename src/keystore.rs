//! Local key store: own P-256 pair, the peer's public key, and the cached
//! shared secret derived from them.
//!
//! # Storage structure
//!
//! ```text
//! ownPrivateKey   PKCS#8 DER, hex
//! ownPublicKey    SPKI DER, hex
//! peerPublicKey   SPKI DER, hex
//! ```
//!
//! The shared secret is derived on demand and cached in memory only.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};

use p256::PublicKey;

use crate::error::Result;
use crate::key_exchange::{export_public_key_hex, import_public_key_hex, KeyPair, SharedSecret};
use crate::storage::KeyValueStore;

/// Storage key for the own private key.
pub const STORAGE_KEY_OWN_PRIVATE: &str = "ownPrivateKey";
/// Storage key for the own public key.
pub const STORAGE_KEY_OWN_PUBLIC: &str = "ownPublicKey";
/// Storage key for the peer public key.
pub const STORAGE_KEY_PEER_PUBLIC: &str = "peerPublicKey";

#[derive(Default)]
struct Cache {
    own: Option<KeyPair>,
    peer: Option<PublicKey>,
    secret: Option<SharedSecret>,
}

/// Persisted key material for one wallet connection.
pub struct KeyStore {
    storage: Arc<dyn KeyValueStore>,
    cache: Mutex<Cache>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KeyStore")
            .field("has_own", &cache.own.is_some())
            .field("has_peer", &cache.peer.is_some())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Key store over `storage`; nothing is read until first use.
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Own key pair, restored from storage or generated and persisted.
    ///
    /// A stored private key that no longer decodes is replaced.
    pub fn own_key_pair(&self) -> Result<KeyPair> {
        let mut cache = self.lock();
        if let Some(pair) = &cache.own {
            return Ok(pair.clone());
        }

        let restored = self
            .storage
            .get_item(STORAGE_KEY_OWN_PRIVATE)
            .and_then(|hex| match KeyPair::from_private_key_hex(&hex) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    log::warn!("[KeyStore] Discarding unreadable own key: {e}");
                    None
                }
            });

        let pair = match restored {
            Some(pair) => pair,
            None => {
                let pair = KeyPair::generate()?;
                self.storage
                    .set_item(STORAGE_KEY_OWN_PRIVATE, &pair.private_key_hex()?)?;
                self.storage
                    .set_item(STORAGE_KEY_OWN_PUBLIC, &pair.public_key_hex())?;
                log::debug!("[KeyStore] Generated new own key pair");
                pair
            }
        };
        cache.own = Some(pair.clone());
        Ok(pair)
    }

    /// Peer public key if one has been stored.
    pub fn peer_public_key(&self) -> Option<PublicKey> {
        let mut cache = self.lock();
        if cache.peer.is_none() {
            let hex = self.storage.get_item(STORAGE_KEY_PEER_PUBLIC)?;
            match import_public_key_hex(&hex) {
                Ok(key) => cache.peer = Some(key),
                Err(e) => log::warn!("[KeyStore] Ignoring unreadable peer key: {e}"),
            }
        }
        cache.peer.clone()
    }

    /// Store the peer public key, dropping any secret derived from a previous peer.
    pub fn set_peer_public_key(&self, key: &PublicKey) -> Result<()> {
        self.storage
            .set_item(STORAGE_KEY_PEER_PUBLIC, &export_public_key_hex(key))?;
        let mut cache = self.lock();
        cache.peer = Some(key.clone());
        cache.secret = None;
        Ok(())
    }

    /// Shared secret with the stored peer, derived once and cached.
    ///
    /// `None` until a peer key is known.
    pub fn shared_secret(&self) -> Result<Option<SharedSecret>> {
        if let Some(secret) = &self.lock().secret {
            return Ok(Some(secret.clone()));
        }
        let Some(peer) = self.peer_public_key() else {
            return Ok(None);
        };
        let secret = self.own_key_pair()?.derive_shared_secret(&peer);
        self.lock().secret = Some(secret.clone());
        Ok(Some(secret))
    }

    /// Erase all key material, persisted and cached.
    pub fn clear(&self) -> Result<()> {
        self.storage.remove_item(STORAGE_KEY_OWN_PRIVATE)?;
        self.storage.remove_item(STORAGE_KEY_OWN_PUBLIC)?;
        self.storage.remove_item(STORAGE_KEY_PEER_PUBLIC)?;
        *self.lock() = Cache::default();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
