//! Dapp-facing entry point: handshake, encrypted requests, teardown.
//!
//! A [`Connector`] drives one [`Channel`] (popup or relay) and owns the key
//! material for the wallet on the other end.
//!
//! ```text
//! handshake()  connect ─▶ fresh key pair ─▶ {handshake} in clear
//!                       ◀─ response.sender = wallet public key
//!                       ─▶ ECDH ─▶ SecureEnvelope ─▶ decrypt accounts
//!
//! request()    SecureEnvelope.encrypt({action, chainId}) ─▶ channel
//!                       ◀─ {encrypted} ─▶ decrypt {result:{value}|{error}}
//! ```
//!
//! The shared secret survives restarts through the [`KeyStore`], so a
//! request issued after a restart resumes without a new handshake.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, PopupChannel, PopupHost, RelayChannel, RelaySettings};
use crate::config::Config;
use crate::correlator::RequestCorrelator;
use crate::envelope::{
    DecryptedResponse, EncryptedRequest, HandshakeContent, RequestContent, RequestEnvelope,
    ResponseContent, ResponseEnvelope, RpcAction, SecureEnvelope, PROTOCOL_VERSION,
};
use crate::error::{LinkError, Result};
use crate::key_exchange::import_public_key_hex;
use crate::keystore::KeyStore;
use crate::link::link_url;
use crate::session::Session;
use crate::storage::{KeyValueStore, ScopedStorage};

/// Storage key recording the library version that last wrote the scope.
pub const STORAGE_KEY_VERSION: &str = "version";

/// RPC method whose success changes the active chain.
const SWITCH_CHAIN_METHOD: &str = "wallet_switchEthereumChain";

/// Dapp identity announced in the handshake, plus the starting chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorOptions {
    /// Name shown by the wallet when asked to connect.
    pub dapp_name: String,
    /// Logo shown next to the name.
    pub dapp_logo_url: Option<String>,
    /// Chain requests start on.
    pub chain_id: u64,
}

impl ConnectorOptions {
    /// Options taken from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            dapp_name: config.dapp_name.clone(),
            dapp_logo_url: config.dapp_logo_url.clone(),
            chain_id: config.chain_id,
        }
    }
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Secure connection to one wallet over one channel.
#[derive(Debug)]
pub struct Connector {
    channel: Arc<dyn Channel>,
    /// Same channel when it is a relay; carries the session.
    relay: Option<(Arc<RelayChannel>, String)>,
    storage: Arc<dyn KeyValueStore>,
    keys: KeyStore,
    envelope: Mutex<Option<Arc<SecureEnvelope>>>,
    options: ConnectorOptions,
    chain_id: AtomicU64,
}

impl Connector {
    /// Connector over an arbitrary channel, persisting keys in `storage`.
    pub fn new(
        channel: Arc<dyn Channel>,
        storage: Arc<dyn KeyValueStore>,
        options: ConnectorOptions,
    ) -> Result<Self> {
        storage.set_item(STORAGE_KEY_VERSION, PROTOCOL_VERSION)?;
        Ok(Self {
            channel,
            relay: None,
            keys: KeyStore::new(Arc::clone(&storage)),
            storage,
            envelope: Mutex::new(None),
            chain_id: AtomicU64::new(options.chain_id),
            options,
        })
    }

    /// Connector to a popup-hosted wallet at `config.popup_url`.
    ///
    /// Key material is scoped to the popup origin inside `storage`.
    pub fn popup(
        config: &Config,
        host: Arc<dyn PopupHost>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let url = config.popup_url().map_err(invalid_config)?;
        let scoped: Arc<dyn KeyValueStore> = Arc::new(ScopedStorage::new(
            storage,
            &ScopedStorage::scope_for_origin(&url),
        ));
        let correlator = RequestCorrelator::new(config.request_timeout());
        let channel = Arc::new(PopupChannel::new(host, url, correlator));
        Self::new(channel, scoped, ConnectorOptions::from_config(config))
    }

    /// Connector to a wallet reached through the relay at `config.relay_url`.
    ///
    /// Restores the relay session from `storage` (scoped to the relay
    /// origin) or creates and persists a new one.
    pub fn relay(config: &Config, storage: Arc<dyn KeyValueStore>) -> Result<Self> {
        let url = config.relay_url().map_err(invalid_config)?;
        let scoped: Arc<dyn KeyValueStore> = Arc::new(ScopedStorage::new(
            storage,
            &ScopedStorage::scope_for_origin(&url),
        ));
        let session = Session::load_or_create(scoped.as_ref())?;
        log::info!("[Session] Using session {session:?}");

        let settings = RelaySettings::from_config(config).map_err(invalid_config)?;
        let correlator = RequestCorrelator::new(config.request_timeout());
        let relay = Arc::new(RelayChannel::new(
            session,
            Arc::clone(&scoped),
            settings,
            correlator,
        )?);

        let mut connector = Self::new(
            Arc::clone(&relay) as Arc<dyn Channel>,
            scoped,
            ConnectorOptions::from_config(config),
        )?;
        connector.relay = Some((relay, config.relay_url.clone()));
        Ok(connector)
    }

    /// Establish the shared secret and return the wallet's accounts.
    ///
    /// Always starts from fresh keys. Any failure leaves no key material
    /// behind.
    pub async fn handshake(&self) -> Result<Vec<String>> {
        self.handshake_with_cancel(&CancellationToken::new()).await
    }

    /// [`Self::handshake`], abandoned when `cancel` fires.
    pub async fn handshake_with_cancel(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.channel.connect().await?;
        self.reset_keys();

        let result = self.exchange_keys(cancel).await;
        match &result {
            Ok(accounts) => {
                log::info!(
                    "[{}] Handshake complete, {} account(s)",
                    self.channel.name(),
                    accounts.len()
                );
                self.channel.mark_linked();
            }
            Err(e) => {
                log::warn!("[{}] Handshake failed: {e}", self.channel.name());
                self.reset_keys();
            }
        }
        result
    }

    async fn exchange_keys(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let own = self.keys.own_key_pair()?;
        let handshake = HandshakeContent::request_accounts(
            &self.options.dapp_name,
            self.options.dapp_logo_url.as_deref(),
        );
        let request = RequestEnvelope::new(own.public_key_hex(), RequestContent::Handshake(handshake));
        let response = self.channel.request(request, cancel).await?;
        if let ResponseContent::Failure(failure) = &response.content {
            return Err(LinkError::ProtocolFailure(failure.clone()));
        }

        let peer = import_public_key_hex(&response.sender)?;
        self.keys.set_peer_public_key(&peer)?;
        let secret = self.keys.shared_secret()?.ok_or(LinkError::InvalidSession)?;
        let envelope = Arc::new(SecureEnvelope::new(secret));

        let value = open_response(&envelope, response)?;
        let accounts: Vec<String> = serde_json::from_value(value)
            .map_err(|e| LinkError::protocol(format!("handshake result is not an account list: {e}")))?;

        *self.lock_envelope() = Some(envelope);
        Ok(accounts)
    }

    /// Send an encrypted RPC request and return its result value.
    ///
    /// Needs a completed handshake. The channel is connected again first if
    /// it dropped since, so a closed popup is reopened.
    pub async fn request(&self, action: RpcAction) -> Result<Value> {
        self.request_with_cancel(action, &CancellationToken::new()).await
    }

    /// [`Self::request`], abandoned with `Cancelled` when `cancel` fires.
    pub async fn request_with_cancel(
        &self,
        action: RpcAction,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let envelope = self.secure_envelope()?;
        // A popup the user closed since the handshake is reopened here.
        tokio::select! {
            connected = self.channel.connect() => connected?,
            () = cancel.cancelled() => return Err(LinkError::Cancelled),
        }
        let sender = self.keys.own_key_pair()?.public_key_hex();
        let switch_to = (action.method == SWITCH_CHAIN_METHOD)
            .then(|| requested_chain_id(&action.params))
            .flatten();

        let content = envelope.encrypt(&EncryptedRequest {
            action,
            chain_id: self.chain_id(),
        })?;
        let request = RequestEnvelope::new(sender, RequestContent::Encrypted(content));
        let response = self.channel.request(request, cancel).await?;
        let value = open_response(&envelope, response)?;

        if let Some(chain_id) = switch_to {
            log::info!("[{}] Switched to chain {chain_id}", self.channel.name());
            self.chain_id.store(chain_id, Ordering::SeqCst);
        }
        Ok(value)
    }

    /// Close the channel and forget the wallet.
    ///
    /// Pending requests fail with `ChannelClosed`. Key material is erased;
    /// a relay session is erased too, so the next connection starts a new one.
    pub async fn disconnect(&self) -> Result<()> {
        self.channel.disconnect().await;
        *self.lock_envelope() = None;
        self.keys.clear()?;
        if self.relay.is_some() {
            Session::clear(self.storage.as_ref())?;
        }
        Ok(())
    }

    /// Tracks whether the channel can carry envelopes.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.channel.state().watch_connected()
    }

    /// Tracks whether a wallet has accepted the session.
    pub fn linked(&self) -> watch::Receiver<bool> {
        self.channel.state().watch_linked()
    }

    /// Chain id sent with the next request.
    pub fn chain_id(&self) -> u64 {
        self.chain_id.load(Ordering::SeqCst)
    }

    /// Relay session, `None` for popup connectors.
    pub fn session(&self) -> Option<Session> {
        self.relay.as_ref().map(|(relay, _)| relay.session())
    }

    /// URL a wallet opens to join the relay session.
    pub fn link_url(&self) -> Option<String> {
        let (relay, server) = self.relay.as_ref()?;
        let session = relay.session();
        Some(link_url(
            session.id(),
            session.secret(),
            server,
            false,
            Some(self.chain_id()),
        ))
    }

    /// Underlying transport.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// The established envelope, or one rebuilt from persisted keys.
    fn secure_envelope(&self) -> Result<Arc<SecureEnvelope>> {
        if let Some(envelope) = self.lock_envelope().as_ref() {
            return Ok(Arc::clone(envelope));
        }
        let secret = self.keys.shared_secret()?.ok_or(LinkError::InvalidSession)?;
        log::debug!("[{}] Restored shared secret from storage", self.channel.name());
        let envelope = Arc::new(SecureEnvelope::new(secret));
        *self.lock_envelope() = Some(Arc::clone(&envelope));
        Ok(envelope)
    }

    fn reset_keys(&self) {
        *self.lock_envelope() = None;
        if let Err(e) = self.keys.clear() {
            log::warn!("[KeyStore] Failed to clear keys: {e}");
        }
    }

    fn lock_envelope(&self) -> std::sync::MutexGuard<'_, Option<Arc<SecureEnvelope>>> {
        self.envelope.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrypt a response body into its result value.
fn open_response(envelope: &SecureEnvelope, response: ResponseEnvelope) -> Result<Value> {
    match response.content {
        ResponseContent::Failure(failure) => Err(LinkError::ProtocolFailure(failure)),
        ResponseContent::Encrypted(content) => envelope.decrypt::<DecryptedResponse>(&content)?.into_result(),
    }
}

/// `params[0].chainId` of a chain switch, hex (`"0x2105"`) or decimal.
fn requested_chain_id(params: &Value) -> Option<u64> {
    let raw = params.get(0)?.get("chainId")?;
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

fn invalid_config(e: anyhow::Error) -> LinkError {
    LinkError::ConnectionFailed(format!("{e:#}"))
}
