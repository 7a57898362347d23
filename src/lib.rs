//! WalletLink - secure sessions between a dapp and a wallet.
//!
//! This crate implements the dapp side of the WalletLink protocol: it
//! establishes an ECDH shared secret with a wallet, exchanges encrypted
//! `scw` envelopes with it, and matches responses to the requests that
//! caused them.
//!
//! # Architecture
//!
//! - **Connector** - Entry point, owns the keys and one channel
//! - **Channel** - Transport adapter, either a popup window or a relay server
//! - **Correlator** - Pending-request table shared by a channel's read loop
//! - **Storage** - `localStorage`-style persistence for sessions and keys
//!
//! # Modules
//!
//! - [`session`] - Relay session identity and persistence
//! - [`key_exchange`] - P-256 ECDH key pairs and shared secrets
//! - [`envelope`] - Wire envelopes and their encrypted payloads
//! - [`correlator`] - Request/response matching with timeout and cancellation
//! - [`channel`] - Popup and relay transports
//! - [`connector`] - Handshake, requests, teardown
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod channel;
pub mod connector;
pub mod correlator;
pub mod envelope;
pub mod key_exchange;
pub mod keystore;
pub mod session;
pub mod storage;
pub mod ws;

pub mod config;
pub mod crypto;
pub mod error;
pub mod file_watcher;
pub mod link;
pub mod logging;

// Re-export commonly used types
pub use channel::{Channel, ConnectionState, PopupChannel, RelayChannel};
pub use config::Config;
pub use connector::{Connector, ConnectorOptions};
pub use correlator::RequestCorrelator;
pub use envelope::{RequestEnvelope, ResponseEnvelope, RpcAction, SecureEnvelope};
pub use error::{LinkError, Result};
pub use key_exchange::{KeyPair, SharedSecret};
pub use session::Session;
pub use storage::{FileStore, KeyValueStore, MemoryStore, ScopedStorage};
