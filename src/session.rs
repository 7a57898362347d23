//! Durable session identity shared between a dapp and a linked wallet.
//!
//! A [`Session`] is the pair (id, secret) both endpoints use to recognize
//! each other through the relay. The wallet learns both out of band (QR
//! code); the relay only ever sees the id and the derived `key`.
//!
//! # Storage structure
//!
//! ```text
//! session:id      32 hex chars (128 bits)
//! session:secret  64 hex chars (256 bits)
//! session:linked  "1" | "0"
//! ```
//!
//! The derived key is `SHA-256("{id}, {secret} WalletLink")` and is never
//! persisted: it is recomputed on every load, so a tampered id or secret
//! yields a key the relay will not recognize.

// Rust guideline compliant 2026-02

use futures_util::stream::{self, Stream};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{LinkError, Result};
use crate::storage::{KeyValueStore, StorageSubscription};

/// Storage key holding the session id.
pub const STORAGE_KEY_SESSION_ID: &str = "session:id";
/// Storage key holding the session secret.
pub const STORAGE_KEY_SESSION_SECRET: &str = "session:secret";
/// Storage key holding the linked flag.
pub const STORAGE_KEY_SESSION_LINKED: &str = "session:linked";

const ID_BYTES: usize = 16;
const SECRET_BYTES: usize = 32;
const KEY_DOMAIN: &str = "WalletLink";

/// Session identity with its derived relay key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Session {
    id: String,
    secret: String,
    key: String,
    linked: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &short(&self.id))
            .field("linked", &self.linked)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a fresh, unlinked session from OS randomness.
    #[must_use]
    pub fn create() -> Self {
        let mut id = [0u8; ID_BYTES];
        let mut secret = [0u8; SECRET_BYTES];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut id);
        rng.fill_bytes(&mut secret);

        let session = Self::from_parts(
            &data_encoding::HEXLOWER.encode(&id),
            &data_encoding::HEXLOWER.encode(&secret),
            false,
        );
        secret.zeroize();
        log::debug!("[Session] Created session {}", short(&session.id));
        session
    }

    /// Rebuild a session from its persisted parts, recomputing the key.
    #[must_use]
    pub fn from_parts(id: &str, secret: &str, linked: bool) -> Self {
        Self {
            id: id.to_string(),
            secret: secret.to_string(),
            key: derive_key(id, secret),
            linked,
        }
    }

    /// Restore the persisted session, if both id and secret are present.
    pub fn load(storage: &dyn KeyValueStore) -> Option<Self> {
        let id = storage.get_item(STORAGE_KEY_SESSION_ID)?;
        let secret = storage.get_item(STORAGE_KEY_SESSION_SECRET)?;
        if id.is_empty() || secret.is_empty() {
            return None;
        }
        let linked = storage.get_item(STORAGE_KEY_SESSION_LINKED).as_deref() == Some("1");
        Some(Self::from_parts(&id, &secret, linked))
    }

    /// Restore the persisted session or create and persist a new one.
    pub fn load_or_create(storage: &dyn KeyValueStore) -> Result<Self> {
        if let Some(session) = Self::load(storage) {
            log::info!("[Session] Restored session {}", short(&session.id));
            return Ok(session);
        }
        let session = Self::create();
        session.persist(storage)?;
        Ok(session)
    }

    /// Erase the persisted session.
    pub fn clear(storage: &dyn KeyValueStore) -> Result<()> {
        storage.remove_item(STORAGE_KEY_SESSION_SECRET)?;
        storage.remove_item(STORAGE_KEY_SESSION_ID)?;
        storage.remove_item(STORAGE_KEY_SESSION_LINKED)?;
        Ok(())
    }

    /// Write id, secret and linked flag.
    pub fn persist(&self, storage: &dyn KeyValueStore) -> Result<()> {
        storage.set_item(STORAGE_KEY_SESSION_ID, &self.id)?;
        storage.set_item(STORAGE_KEY_SESSION_SECRET, &self.secret)?;
        self.persist_linked(storage)
    }

    /// Update the linked flag and re-persist it.
    pub fn set_linked(&mut self, storage: &dyn KeyValueStore, linked: bool) -> Result<()> {
        self.linked = linked;
        self.persist_linked(storage)
    }

    /// Clear the linked flag without writing it back.
    pub(crate) fn forget_linked(&mut self) {
        self.linked = false;
    }

    fn persist_linked(&self, storage: &dyn KeyValueStore) -> Result<()> {
        storage.set_item(STORAGE_KEY_SESSION_LINKED, if self.linked { "1" } else { "0" })
    }

    /// Stream of changes to the persisted session id made by other handles
    /// (another tab or process).
    ///
    /// The stream is infinite while the store lives. Each call opens a new
    /// subscription, so a dropped stream can simply be requested again.
    pub fn observe_external_id_change(
        storage: &dyn KeyValueStore,
    ) -> impl Stream<Item = SessionIdChange> + Send + Unpin + 'static {
        Box::pin(stream::unfold(storage.subscribe(), next_id_change))
    }

    /// Public session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hex secret shared with the wallet out of band.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Derived key presented to the relay server.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether a wallet has joined this session.
    #[must_use]
    pub fn linked(&self) -> bool {
        self.linked
    }

    /// Whether `key` is the key this id and secret derive.
    #[must_use]
    pub fn matches_key(&self, key: &str) -> bool {
        derive_key(&self.id, &self.secret) == key
    }

    /// Raw secret bytes, used as the relay payload sealing key.
    pub fn secret_bytes(&self) -> Result<[u8; SECRET_BYTES]> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(self.secret.as_bytes())
            .map_err(|e| LinkError::InvalidKeyEncoding(format!("session secret: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| LinkError::InvalidKeyEncoding("session secret must be 32 bytes".into()))
    }
}

/// A change to the persisted session id observed from outside this handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdChange {
    /// Id before the change.
    pub old_value: Option<String>,
    /// Id after the change.
    pub new_value: Option<String>,
}

impl SessionIdChange {
    /// The session was destroyed elsewhere (e.g. disconnect in another tab).
    #[must_use]
    pub fn is_teardown(&self) -> bool {
        self.old_value.is_some() && self.new_value.is_none()
    }
}

async fn next_id_change(
    mut sub: StorageSubscription,
) -> Option<(SessionIdChange, StorageSubscription)> {
    loop {
        let event = sub.recv().await?;
        if event.key == STORAGE_KEY_SESSION_ID {
            let change = SessionIdChange {
                old_value: event.old_value.filter(|v| !v.is_empty()),
                new_value: event.new_value.filter(|v| !v.is_empty()),
            };
            return Some((change, sub));
        }
    }
}

/// `SHA-256("{id}, {secret} WalletLink")` as lowercase hex.
#[must_use]
pub fn derive_key(id: &str, secret: &str) -> String {
    let digest = Sha256::digest(format!("{id}, {secret} {KEY_DOMAIN}").as_bytes());
    data_encoding::HEXLOWER.encode(&digest)
}

/// First 8 characters of an identifier, for logs.
pub(crate) fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}
