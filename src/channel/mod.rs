//! Transport abstraction between the connector and a wallet surface.
//!
//! # Architecture
//!
//! ```text
//! Channel (trait)
//!     │
//!     ├── PopupChannel   window.open + postMessage, readiness handshake
//!     │
//!     └── RelayChannel   WebSocket to a relay server, sealed payloads,
//!                        heartbeat, reconnect with backoff
//! ```
//!
//! Both channels carry the same `scw` envelopes and own a
//! [`RequestCorrelator`]: their read loops resolve pending requests as
//! responses arrive, and their teardown paths reject every pending request
//! with the error matching the cause.

// Rust guideline compliant 2026-02

pub mod popup;
pub mod relay;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::correlator::RequestCorrelator;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::Result;

pub use popup::{OpenedPopup, PopupChannel, PopupEvent, PopupHost, PopupState, PopupWindow};
pub use relay::{RelayChannel, RelaySettings};

/// Connection state for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Transport open and ready to carry envelopes.
    Connected,
    /// A wallet has joined the session.
    Linked,
}

impl ConnectionState {
    /// Whether envelopes can be carried right now.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Linked)
    }
}

/// Connection state observable from outside the channel.
///
/// Publishes three views through `watch` channels: the full state, a
/// `connected` flag, and a `linked` flag. `linked` is sticky across
/// transport drops and only clears on [`Self::reset`], since a session stays
/// linked while its socket reconnects.
#[derive(Debug)]
pub struct SharedConnectionState {
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    linked: watch::Sender<bool>,
}

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SharedConnectionState {
    /// Create new shared state, `Disconnected`.
    pub fn new(linked: bool) -> Self {
        Self {
            state: watch::channel(ConnectionState::Disconnected).0,
            connected: watch::channel(false).0,
            linked: watch::channel(linked).0,
        }
    }

    /// Get the current state.
    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Set the state, notifying observers only on change.
    pub fn set(&self, new_state: ConnectionState) {
        self.state.send_if_modified(|state| {
            let changed = *state != new_state;
            *state = new_state;
            changed
        });
        let connected = new_state.is_connected();
        self.connected.send_if_modified(|c| std::mem::replace(c, connected) != connected);
        if new_state == ConnectionState::Linked {
            self.set_linked(true);
        }
    }

    /// Set the linked flag without touching the transport state.
    pub fn set_linked(&self, linked: bool) {
        self.linked.send_if_modified(|l| std::mem::replace(l, linked) != linked);
    }

    /// Back to `Disconnected` and unlinked.
    pub fn reset(&self) {
        self.set(ConnectionState::Disconnected);
        self.set_linked(false);
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.get().is_connected()
    }

    /// Check if a wallet is linked.
    pub fn is_linked(&self) -> bool {
        *self.linked.borrow()
    }

    /// Watch the full state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Watch the `connected` flag.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Watch the `linked` flag.
    pub fn watch_linked(&self) -> watch::Receiver<bool> {
        self.linked.subscribe()
    }
}

/// A transport carrying `scw` envelopes to a wallet surface.
#[async_trait]
pub trait Channel: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open the transport. Concurrent and repeated calls share one
    /// connection; returns once envelopes can be delivered.
    async fn connect(&self) -> Result<()>;

    /// Send `envelope` and wait for the response carrying its id.
    async fn request(
        &self,
        envelope: RequestEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope>;

    /// Close the transport and reject every pending request with
    /// `ChannelClosed`.
    async fn disconnect(&self);

    /// Record that the wallet accepted the session.
    fn mark_linked(&self);

    /// Observable connection state.
    fn state(&self) -> &SharedConnectionState;
}

/// Route an inbound message to the pending request it answers.
///
/// Malformed envelopes that still name a `requestId` fail that request with
/// the decode error; anything else unroutable is logged and dropped.
pub(crate) fn dispatch_inbound(
    channel: &str,
    correlator: &RequestCorrelator<ResponseEnvelope>,
    message: Value,
) {
    let request_id = message
        .get("requestId")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok());

    match ResponseEnvelope::from_value(message) {
        Ok(envelope) => {
            let id = envelope.request_id;
            if !correlator.resolve(id, envelope) {
                log::debug!("[{channel}] Late or unknown response for {id}, dropped");
            }
        }
        Err(e) => match request_id {
            Some(id) => {
                log::warn!("[{channel}] Rejecting response for {id}: {e}");
                correlator.reject(id, e);
            }
            None => log::warn!("[{channel}] Dropping unroutable message: {e}"),
        },
    }
}
