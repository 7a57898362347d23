//! Relay-server channel.
//!
//! Keeps a WebSocket open to the relay, hosts the session on it, and
//! exchanges envelopes with the wallet as `PublishEvent` / `Event` frames.
//! The relay only ever sees ciphertext: each envelope is sealed with
//! AES-256-GCM under the session secret before it is published.
//!
//! # Connection lifecycle
//!
//! ```text
//!  Disconnected ──▶ Connecting ──HostSession OK──▶ Connected ──linked──▶ Linked
//!        ▲               │                             │                   │
//!        │    failure    │          socket loss / heartbeat timeout        │
//!        └───────────────┴─────────────────────────────┴───────────────────┘
//!                     backoff 1s, 2s, 4s … capped, then retry
//! ```
//!
//! A background task owns the socket. Outbound envelopes queue on an mpsc
//! channel and are only drained while connected, so requests issued during
//! a reconnect, or whose write failed, are delivered once the socket is
//! back. After `max_reconnect_attempts` consecutive failures the task gives
//! up and every pending request fails with `ChannelClosed`.
//!
//! While the task runs, the channel also watches storage for the session id
//! being removed by another handle (a disconnect in another tab). That stops
//! the task, unlinks the channel and fails pending requests.

// Rust guideline compliant 2026-02

pub mod protocol;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use self::protocol::{ClientMessage, ServerMessage, EVENT_WEB3_REQUEST, EVENT_WEB3_RESPONSE, HEARTBEAT};
use super::{dispatch_inbound, Channel, ConnectionState, SharedConnectionState};
use crate::config::Config;
use crate::correlator::RequestCorrelator;
use crate::crypto;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{LinkError, Result};
use crate::session::{short, Session, SessionIdChange};
use crate::storage::KeyValueStore;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

const LOG: &str = "Relay";

/// Timing and retry settings for the relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// WebSocket endpoint (`wss://…/rpc`).
    pub socket_url: String,
    /// Bound on the WebSocket handshake plus the `HostSession` reply.
    pub connect_timeout: Duration,
    /// Gap between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Silence after which the socket is considered dead.
    pub heartbeat_timeout: Duration,
    /// First reconnect delay; doubles per failure.
    pub initial_backoff: Duration,
    /// Cap on the reconnect delay.
    pub max_backoff: Duration,
    /// Consecutive failed connection attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl RelaySettings {
    /// Default timings for `socket_url`.
    pub fn new(socket_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            connect_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }

    /// Settings for the relay named by `config.relay_url`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            socket_url: ws::relay_socket_url(&config.relay_url()?),
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        })
    }

    /// Delay before the next attempt, doubling up to the cap.
    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

#[derive(Debug)]
struct Running {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    /// Cancelled by the connection task when it exits for good.
    closed: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    settings: RelaySettings,
    session_id: String,
    session_key: String,
    sealing_key: Zeroizing<[u8; 32]>,
    session: Mutex<Session>,
    storage: Arc<dyn KeyValueStore>,
    correlator: RequestCorrelator<ResponseEnvelope>,
    state: SharedConnectionState,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("socket_url", &self.settings.socket_url)
            .field("session", &short(&self.session_id))
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

/// Channel to a wallet through a relay server.
///
/// Dropping the channel stops its connection task.
#[derive(Debug)]
pub struct RelayChannel {
    inner: Arc<Inner>,
}

impl RelayChannel {
    /// Channel hosting `session` on the relay at `settings.socket_url`.
    ///
    /// The linked flag is persisted to `storage` as it changes.
    pub fn new(
        session: Session,
        storage: Arc<dyn KeyValueStore>,
        settings: RelaySettings,
        correlator: RequestCorrelator,
    ) -> Result<Self> {
        let sealing_key = Zeroizing::new(session.secret_bytes()?);
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                session_id: session.id().to_string(),
                session_key: session.key().to_string(),
                sealing_key,
                state: SharedConnectionState::new(session.linked()),
                session: Mutex::new(session),
                storage,
                correlator,
                running: Mutex::new(None),
            }),
        })
    }

    /// Snapshot of the hosted session.
    pub fn session(&self) -> Session {
        self.inner.session().clone()
    }

    /// Timing and retry settings in use.
    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }

    /// Start the connection task if it is not running; returns its queue and
    /// exit signal.
    fn ensure_running(&self) -> (mpsc::UnboundedSender<String>, CancellationToken) {
        let mut running = self.inner.running();
        if let Some(r) = running.as_ref().filter(|r| !r.closed.is_cancelled()) {
            return (r.outbound.clone(), r.closed.clone());
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let task = tokio::spawn(run_connection_loop(
            Arc::clone(&self.inner),
            outbound_rx,
            shutdown.clone(),
            closed.clone(),
        ));
        tokio::spawn(watch_session_removal(
            Arc::downgrade(&self.inner),
            Session::observe_external_id_change(self.inner.storage.as_ref()),
            shutdown.clone(),
        ));
        *running = Some(Running {
            outbound: outbound.clone(),
            shutdown,
            closed: closed.clone(),
            task,
        });
        (outbound, closed)
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        if let Some(running) = self.inner.running().take() {
            running.shutdown.cancel();
        }
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_linked(&self, linked: bool) {
        {
            let mut session = self.session();
            if session.linked() != linked {
                match session.set_linked(self.storage.as_ref(), linked) {
                    Ok(()) => log::info!("[Relay] Session {} linked={linked}", short(&self.session_id)),
                    Err(e) => log::warn!("[Relay] Failed to persist linked flag: {e}"),
                }
            }
        }
        self.state.set_linked(linked);
        if linked && self.state.get() == ConnectionState::Connected {
            self.state.set(ConnectionState::Linked);
        }
    }

    fn seal(&self, envelope: &RequestEnvelope) -> Result<String> {
        let json = serde_json::to_vec(&envelope.to_value()?)
            .map_err(|e| LinkError::protocol(format!("encode failed: {e}")))?;
        crypto::seal_hex(&self.sealing_key, &json)
    }

    fn open(&self, data: &str) -> Result<serde_json::Value> {
        let plaintext = crypto::open_hex(&self.sealing_key, data)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| LinkError::protocol(format!("sealed payload is not JSON: {e}")))
    }
}

#[async_trait]
impl Channel for RelayChannel {
    fn name(&self) -> &'static str {
        LOG
    }

    async fn connect(&self) -> Result<()> {
        let (_, closed) = self.ensure_running();
        let mut state = self.inner.state.watch_state();
        loop {
            if state.borrow_and_update().is_connected() {
                return Ok(());
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(LinkError::ChannelClosed);
                    }
                }
                () = closed.cancelled() => return Err(LinkError::ChannelClosed),
            }
        }
    }

    async fn request(
        &self,
        envelope: RequestEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let sealed = self.inner.seal(&envelope)?;
        let (outbound, _) = self.ensure_running();
        self.inner
            .correlator
            .send(
                envelope.id,
                || async move { outbound.send(sealed).map_err(|_| LinkError::ChannelClosed) },
                cancel,
            )
            .await
    }

    async fn disconnect(&self) {
        let running = self.inner.running().take();
        if let Some(running) = running {
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                log::warn!("[Relay] Connection task ended abnormally: {e}");
            }
        }
        self.inner.correlator.reject_all(&LinkError::ChannelClosed);
        self.inner.state.reset();
        log::info!("[Relay] Disconnected");
    }

    fn mark_linked(&self) {
        self.inner.set_linked(true);
    }

    fn state(&self) -> &SharedConnectionState {
        &self.inner.state
    }
}

/// Stop the connection when another handle removes this session's id.
async fn watch_session_removal(
    weak: Weak<Inner>,
    mut changes: impl Stream<Item = SessionIdChange> + Unpin,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            change = changes.next() => change,
            () = shutdown.cancelled() => return,
        };
        let (Some(change), Some(inner)) = (change, weak.upgrade()) else {
            return;
        };
        if !change.is_teardown() || change.old_value.as_deref() != Some(inner.session_id.as_str()) {
            continue;
        }

        log::warn!("[Relay] Session {} removed by another handle", short(&inner.session_id));
        shutdown.cancel();
        // The other handle already cleared storage; only forget in memory.
        inner.session().forget_linked();
        inner.correlator.reject_all(&LinkError::ChannelClosed);
        inner.state.reset();
        return;
    }
}

/// Result of the inner message loop.
enum ConnectionLoopExit {
    /// Shutdown was requested.
    Shutdown,
    /// Connection was lost; should reconnect.
    Disconnected,
    /// The wallet destroyed the session; nothing to reconnect to.
    Destroyed,
}

/// Main connection loop with reconnection.
async fn run_connection_loop(
    inner: Arc<Inner>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) {
    let settings = &inner.settings;
    let mut backoff = settings.initial_backoff;
    let mut failures: u32 = 0;
    let mut backlog: VecDeque<String> = VecDeque::new();
    let mut next_id: u64 = 1;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        inner.state.set(ConnectionState::Connecting);
        log::info!("[Relay] Connecting to {}", settings.socket_url);

        let exit = match host_session(&inner, &mut next_id).await {
            Ok((mut writer, mut reader)) => {
                log::info!("[Relay] Hosting session {}", short(&inner.session_id));
                failures = 0;
                backoff = settings.initial_backoff;
                // Linked again only once the relay confirms it.
                inner.state.set(ConnectionState::Connected);
                run_message_loop(
                    &inner,
                    &mut writer,
                    &mut reader,
                    &mut outbound_rx,
                    &mut backlog,
                    &mut next_id,
                    &shutdown,
                )
                .await
            }
            Err(e) => {
                failures += 1;
                log::warn!(
                    "[Relay] Connection failed ({failures}/{}): {e:#}",
                    settings.max_reconnect_attempts
                );
                ConnectionLoopExit::Disconnected
            }
        };

        inner.state.set(ConnectionState::Disconnected);

        match exit {
            ConnectionLoopExit::Shutdown => break,
            ConnectionLoopExit::Destroyed => {
                log::warn!("[Relay] Session destroyed by the wallet");
                inner.set_linked(false);
                inner.correlator.reject_all(&LinkError::ChannelClosed);
                break;
            }
            ConnectionLoopExit::Disconnected => {}
        }

        if failures >= settings.max_reconnect_attempts {
            log::error!("[Relay] Giving up after {failures} failed attempts");
            inner.correlator.reject_all(&LinkError::ChannelClosed);
            break;
        }

        log::info!("[Relay] Reconnecting in {backoff:?}");
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = shutdown.cancelled() => break,
        }
        backoff = settings.next_backoff(backoff);
    }

    shutdown.cancel();
    closed.cancel();
}

/// Open the socket, host the session and ask for its link status.
async fn host_session(inner: &Inner, next_id: &mut u64) -> anyhow::Result<(WsWriter, WsReader)> {
    let settings = &inner.settings;
    let (mut writer, mut reader) = ws::connect(&settings.socket_url, settings.connect_timeout).await?;

    let host = ClientMessage::HostSession {
        id: take_id(next_id),
        session_id: inner.session_id.clone(),
        session_key: inner.session_key.clone(),
    };
    writer.send_text(&host.to_text()).await?;

    tokio::time::timeout(settings.connect_timeout, wait_for_ack(&mut reader, host.id()))
        .await
        .map_err(|_| anyhow::anyhow!("no HostSession reply within {:?}", settings.connect_timeout))??;

    let is_linked = ClientMessage::IsLinked {
        id: take_id(next_id),
        session_id: inner.session_id.clone(),
    };
    writer.send_text(&is_linked.to_text()).await?;

    let config = ClientMessage::GetSessionConfig {
        id: take_id(next_id),
        session_id: inner.session_id.clone(),
    };
    writer.send_text(&config.to_text()).await?;

    Ok((writer, reader))
}

/// Wait for the `OK` (or `Fail`) answering request `id`.
async fn wait_for_ack(reader: &mut WsReader, id: u64) -> anyhow::Result<()> {
    while let Some(msg) = reader.recv().await {
        match msg? {
            WsMessage::Text(text) if text == HEARTBEAT => {}
            WsMessage::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Ok { id: Some(got) }) if got == id => return Ok(()),
                Ok(ServerMessage::Fail { id: Some(got), error }) if got == id => {
                    anyhow::bail!("relay refused session: {}", error.unwrap_or_default());
                }
                Ok(other) => log::debug!("[Relay] Ignoring {other:?} before HostSession reply"),
                Err(e) => log::debug!("[Relay] Unparseable frame before HostSession reply: {e}"),
            },
            WsMessage::Close { code, reason } => {
                anyhow::bail!("closed by server before HostSession reply ({code} {reason})");
            }
            WsMessage::Binary(_) => {}
        }
    }
    anyhow::bail!("socket ended before HostSession reply")
}

/// Inner message loop for a single WebSocket connection.
///
/// Flushes the backlog, then multiplexes inbound frames, outbound envelopes
/// and the heartbeat until the connection is lost or shutdown is requested.
async fn run_message_loop(
    inner: &Inner,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    backlog: &mut VecDeque<String>,
    next_id: &mut u64,
    shutdown: &CancellationToken,
) -> ConnectionLoopExit {
    let settings = &inner.settings;

    while let Some(data) = backlog.pop_front() {
        if let Err(e) = publish(inner, writer, next_id, &data).await {
            log::warn!("[Relay] Failed to flush backlog: {e:#}");
            backlog.push_front(data);
            return ConnectionLoopExit::Disconnected;
        }
    }

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = reader.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        if handle_text_message(inner, &text) {
                            return ConnectionLoopExit::Destroyed;
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        log::debug!("[Relay] Ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Relay] Connection closed by server ({code} {reason})");
                        return ConnectionLoopExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Relay] WebSocket error: {e:#}");
                        return ConnectionLoopExit::Disconnected;
                    }
                    None => {
                        log::info!("[Relay] WebSocket stream ended");
                        return ConnectionLoopExit::Disconnected;
                    }
                }
            }

            data = outbound_rx.recv() => {
                let Some(data) = data else {
                    let _ = writer.close().await;
                    return ConnectionLoopExit::Shutdown;
                };
                if let Err(e) = publish(inner, writer, next_id, &data).await {
                    log::warn!("[Relay] Failed to publish, will retry after reconnect: {e:#}");
                    backlog.push_front(data);
                    return ConnectionLoopExit::Disconnected;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > settings.heartbeat_timeout {
                    log::warn!("[Relay] No heartbeat reply for {:?}, reconnecting", last_seen.elapsed());
                    return ConnectionLoopExit::Disconnected;
                }
                if let Err(e) = writer.send_text(HEARTBEAT).await {
                    log::warn!("[Relay] Failed to send heartbeat: {e:#}");
                    return ConnectionLoopExit::Disconnected;
                }
            }

            () = shutdown.cancelled() => {
                log::info!("[Relay] Shutdown requested, closing connection");
                let _ = writer.close().await;
                return ConnectionLoopExit::Shutdown;
            }
        }
    }
}

async fn publish(inner: &Inner, writer: &mut WsWriter, next_id: &mut u64, data: &str) -> anyhow::Result<()> {
    let msg = ClientMessage::PublishEvent {
        id: take_id(next_id),
        session_id: inner.session_id.clone(),
        event: EVENT_WEB3_REQUEST.to_string(),
        data: data.to_string(),
        call_webhook: true,
    };
    writer.send_text(&msg.to_text()).await?;
    log::trace!("[Relay] Published request {}", msg.id());
    Ok(())
}

/// Handle one text frame. Returns `true` if the session was destroyed.
fn handle_text_message(inner: &Inner, text: &str) -> bool {
    if text == HEARTBEAT {
        return false;
    }
    let msg = match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("[Relay] Failed to parse frame: {e}");
            return false;
        }
    };
    if msg.is_destroyed() {
        return true;
    }

    match msg {
        ServerMessage::IsLinkedOk { linked, online_guests, .. } => {
            log::debug!("[Relay] IsLinkedOK linked={linked} guests={online_guests}");
            if linked {
                inner.set_linked(true);
            } else if inner.state.is_linked() {
                log::info!("[Relay] Relay reports no wallet linked yet, staying connected");
            }
        }
        ServerMessage::Linked { online_guests } => {
            log::info!("[Relay] Wallet linked ({online_guests} online)");
            inner.set_linked(true);
        }
        ServerMessage::Event { event, data, .. } if event == EVENT_WEB3_RESPONSE => {
            match inner.open(&data) {
                Ok(message) => dispatch_inbound(LOG, &inner.correlator, message),
                Err(e) => log::warn!("[Relay] Dropping undecryptable event: {e}"),
            }
        }
        ServerMessage::Event { event, .. } => log::debug!("[Relay] Ignoring event {event}"),
        ServerMessage::Fail { id, error } => {
            log::warn!("[Relay] Request {id:?} failed: {}", error.unwrap_or_default());
        }
        other => log::trace!("[Relay] {other:?}"),
    }
    false
}

fn take_id(next_id: &mut u64) -> u64 {
    let id = *next_id;
    *next_id += 1;
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn channel() -> RelayChannel {
        RelayChannel::new(
            Session::create(),
            Arc::new(MemoryStore::new()),
            RelaySettings::new("ws://127.0.0.1:1/rpc"),
            RequestCorrelator::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = RelaySettings::new("ws://x");
        let mut delay = settings.initial_backoff;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = settings.next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = RelaySettings::from_config(&Config::default()).unwrap();
        assert_eq!(settings.socket_url, "wss://www.walletlink.org/rpc");
        assert_eq!(settings.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_seal_and_open_roundtrip() {
        let relay = channel();
        let envelope = RequestEnvelope::new(
            "peer",
            crate::envelope::RequestContent::Handshake(
                crate::envelope::HandshakeContent::request_accounts("Dapp", None),
            ),
        );
        let sealed = relay.inner.seal(&envelope).unwrap();
        let opened = relay.inner.open(&sealed).unwrap();
        assert_eq!(RequestEnvelope::from_value(opened).unwrap(), envelope);
    }

    #[test]
    fn test_linked_frames_update_session() {
        let relay = channel();
        assert!(!relay.session().linked());

        assert!(!handle_text_message(&relay.inner, r#"{"type":"Linked","sessionId":"x","onlineGuests":1}"#));

        assert!(relay.session().linked());
        assert!(relay.state().is_linked());
    }

    #[test]
    fn test_linked_session_waits_for_relay_confirmation() {
        let fresh = Session::create();
        let relay = RelayChannel::new(
            Session::from_parts(fresh.id(), fresh.secret(), true),
            Arc::new(MemoryStore::new()),
            RelaySettings::new("ws://127.0.0.1:1/rpc"),
            RequestCorrelator::default(),
        )
        .unwrap();
        relay.inner.state.set(ConnectionState::Connected);

        let not_linked = r#"{"type":"IsLinkedOK","id":2,"sessionId":"x","linked":false,"onlineGuests":0}"#;
        assert!(!handle_text_message(&relay.inner, not_linked));
        assert_eq!(relay.state().get(), ConnectionState::Connected);
        assert!(relay.session().linked());

        let linked = r#"{"type":"IsLinkedOK","id":3,"sessionId":"x","linked":true,"onlineGuests":1}"#;
        assert!(!handle_text_message(&relay.inner, linked));
        assert_eq!(relay.state().get(), ConnectionState::Linked);
    }

    #[test]
    fn test_destroyed_frame_is_reported() {
        let relay = channel();
        let frame = r#"{"type":"SessionConfigUpdated","sessionId":"x","metadata":{"__destroyed":"1"}}"#;
        assert!(handle_text_message(&relay.inner, frame));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let mut settings = RelaySettings::new("ws://127.0.0.1:1/rpc");
        settings.max_reconnect_attempts = 2;
        let relay = RelayChannel::new(
            Session::create(),
            Arc::new(MemoryStore::new()),
            settings,
            RequestCorrelator::default(),
        )
        .unwrap();

        assert_eq!(relay.connect().await, Err(LinkError::ChannelClosed));
        assert_eq!(relay.state().get(), ConnectionState::Disconnected);
    }
}
