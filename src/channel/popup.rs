//! Popup-window channel.
//!
//! The dapp opens the wallet page in a popup and talks to it through
//! `postMessage`. The page announces `{"type":"popupReadyForRequest"}` once
//! its listener is installed; nothing is delivered before that.
//!
//! # State machine
//!
//! ```text
//!         connect()             host.open ok        ready message
//!  Idle ───────────▶ Opening ───────────────▶ AwaitingReady ─────────▶ Open
//!   ▲                   │                          │                     │
//!   │ disconnect()      │ open failed              │ user closed         │ user closed
//!   └───────────────────┴──────────────────────────┴──────▶ Closed ◀─────┘
//! ```
//!
//! `Closed` behaves like `Idle` for the next `connect()`, which opens a new
//! window. Envelopes posted while not `Open` are buffered and flushed on
//! readiness; the phase only becomes `Open` once the buffer is empty, so
//! delivery order matches posting order. The window is owned by the host; this module only sees it
//! through [`PopupHost`] and [`PopupWindow`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{dispatch_inbound, Channel, ConnectionState, SharedConnectionState};
use crate::correlator::RequestCorrelator;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{LinkError, Result};

/// `type` of the readiness message posted by the wallet page.
pub const POPUP_READY_TYPE: &str = "popupReadyForRequest";

const LOG: &str = "Popup";

/// Event delivered by the host for an open popup.
#[derive(Debug, Clone, PartialEq)]
pub enum PopupEvent {
    /// A `message` event posted to the opener.
    Message {
        /// Origin of the posting window.
        origin: String,
        /// Structured-clone payload.
        data: Value,
    },
    /// The window was closed (by the user or the page itself).
    Closed,
}

/// A window handed out by [`PopupHost::open`].
#[async_trait]
pub trait PopupWindow: Send + Sync + std::fmt::Debug {
    /// Post `message` to the window.
    async fn post_message(&self, message: Value) -> Result<()>;

    /// Close the window. Must be idempotent.
    async fn close(&self);
}

/// Result of opening a popup: the window plus its event stream.
#[derive(Debug)]
pub struct OpenedPopup {
    /// Handle for posting to and closing the window.
    pub window: Arc<dyn PopupWindow>,
    /// Messages and the close notification, in order.
    pub events: mpsc::Receiver<PopupEvent>,
}

/// Platform facility that can open popup windows.
#[async_trait]
pub trait PopupHost: Send + Sync + std::fmt::Debug {
    /// Open a window at `url`.
    async fn open(&self, url: &Url) -> Result<OpenedPopup>;
}

/// Popup lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopupState {
    /// No window.
    #[default]
    Idle,
    /// Host is opening the window.
    Opening,
    /// Window open, ready message not seen yet.
    AwaitingReady,
    /// Ready; posts go straight to the window.
    Open,
    /// Closed by the user.
    Closed,
}

type ReadyWaiter = oneshot::Sender<Result<()>>;

#[derive(Debug, Default)]
struct Slot {
    phase: PopupState,
    window: Option<Arc<dyn PopupWindow>>,
    buffer: Vec<Value>,
    waiters: Vec<ReadyWaiter>,
    /// Bumped whenever the current window is abandoned, so late callbacks
    /// from an old window are ignored.
    generation: u64,
    events_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    host: Arc<dyn PopupHost>,
    url: Url,
    origin: String,
    slot: Mutex<Slot>,
    correlator: RequestCorrelator<ResponseEnvelope>,
    state: SharedConnectionState,
}

/// Channel to a wallet page running in a popup window.
#[derive(Debug, Clone)]
pub struct PopupChannel {
    inner: Arc<Inner>,
}

impl PopupChannel {
    /// Channel opening `url`; only messages from `url`'s origin are accepted.
    pub fn new(host: Arc<dyn PopupHost>, url: Url, correlator: RequestCorrelator) -> Self {
        let origin = url.origin().ascii_serialization();
        Self {
            inner: Arc::new(Inner {
                host,
                url,
                origin,
                slot: Mutex::new(Slot::default()),
                correlator,
                state: SharedConnectionState::default(),
            }),
        }
    }

    /// Current lifecycle phase.
    pub fn popup_state(&self) -> PopupState {
        self.inner.lock().phase
    }

    /// Envelopes waiting for the popup to become ready.
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Deliver `message` now if open, otherwise buffer it.
    pub async fn post(&self, message: Value) -> Result<()> {
        let window = {
            let mut slot = self.inner.lock();
            match slot.window.clone().filter(|_| slot.phase == PopupState::Open) {
                Some(window) => window,
                None => {
                    log::debug!("[Popup] Buffering message until ready");
                    slot.buffer.push(message);
                    return Ok(());
                }
            }
        };
        window.post_message(message).await
    }

    async fn open_window(&self, generation: u64) {
        let opened = self.inner.host.open(&self.inner.url).await;
        if let Some(stale) = self.inner.install(generation, opened) {
            stale.close().await;
        }
    }
}

impl Inner {
    /// Adopt a freshly opened window. Returns it back if `disconnect()` ran
    /// while the host was opening, so the caller can close it.
    fn install(
        self: &Arc<Self>,
        generation: u64,
        opened: Result<OpenedPopup>,
    ) -> Option<Arc<dyn PopupWindow>> {
        let mut slot = self.lock();
        if slot.generation != generation {
            return opened.ok().map(|o| o.window);
        }

        match opened {
            Ok(OpenedPopup { window, events }) => {
                log::info!("[Popup] Opened {}, awaiting ready", self.url);
                slot.window = Some(window);
                slot.phase = PopupState::AwaitingReady;
                let weak = Arc::downgrade(self);
                slot.events_task = Some(tokio::spawn(run_event_loop(weak, generation, events)));
                None
            }
            Err(e) => {
                log::warn!("[Popup] Failed to open {}: {e}", self.url);
                slot.phase = PopupState::Idle;
                let waiters = std::mem::take(&mut slot.waiters);
                drop(slot);
                self.state.set(ConnectionState::Disconnected);
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn on_ready(&self, generation: u64) {
        let window = {
            let slot = self.lock();
            if slot.generation != generation || slot.phase != PopupState::AwaitingReady {
                log::debug!("[Popup] Ignoring ready signal in phase {:?}", slot.phase);
                return;
            }
            let Some(window) = slot.window.clone() else {
                return;
            };
            window
        };

        // Posts made during the flush keep buffering until the buffer drains.
        let waiters = loop {
            let batch = {
                let mut slot = self.lock();
                if slot.generation != generation {
                    return;
                }
                if slot.buffer.is_empty() {
                    slot.phase = PopupState::Open;
                    break std::mem::take(&mut slot.waiters);
                }
                std::mem::take(&mut slot.buffer)
            };
            log::debug!("[Popup] Flushing {} buffered message(s)", batch.len());
            for message in batch {
                if let Err(e) = window.post_message(message).await {
                    log::warn!("[Popup] Failed to flush buffered message: {e}");
                }
            }
        };

        log::info!("[Popup] Ready");
        self.state.set(ConnectionState::Connected);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_closed(&self, generation: u64) {
        let waiters = {
            let mut slot = self.lock();
            if slot.generation != generation {
                return;
            }
            slot.generation += 1;
            slot.phase = PopupState::Closed;
            slot.window = None;
            slot.buffer.clear();
            slot.events_task = None;
            std::mem::take(&mut slot.waiters)
        };

        log::info!("[Popup] Closed by user");
        for waiter in waiters {
            let _ = waiter.send(Err(LinkError::UserClosedChannel));
        }
        self.correlator.reject_all(&LinkError::UserClosedChannel);
        self.state.reset();
    }
}

/// Consume host events for one window until it closes.
async fn run_event_loop(weak: Weak<Inner>, generation: u64, mut events: mpsc::Receiver<PopupEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            PopupEvent::Message { origin, data } => {
                if origin != inner.origin {
                    log::debug!("[Popup] Dropping message from foreign origin {origin}");
                    continue;
                }
                if data.get("type").and_then(Value::as_str) == Some(POPUP_READY_TYPE) {
                    inner.on_ready(generation).await;
                } else {
                    dispatch_inbound(LOG, &inner.correlator, data);
                }
            }
            PopupEvent::Closed => {
                inner.on_closed(generation);
                return;
            }
        }
    }
    // Host dropped the event stream: the window is gone.
    if let Some(inner) = weak.upgrade() {
        inner.on_closed(generation);
    }
}

#[async_trait]
impl Channel for PopupChannel {
    fn name(&self) -> &'static str {
        LOG
    }

    async fn connect(&self) -> Result<()> {
        let (rx, open_generation) = {
            let mut slot = self.inner.lock();
            match slot.phase {
                PopupState::Open => return Ok(()),
                PopupState::Opening | PopupState::AwaitingReady => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push(tx);
                    (rx, None)
                }
                PopupState::Idle | PopupState::Closed => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push(tx);
                    slot.phase = PopupState::Opening;
                    slot.generation += 1;
                    (rx, Some(slot.generation))
                }
            }
        };

        if let Some(generation) = open_generation {
            self.inner.state.set(ConnectionState::Connecting);
            self.open_window(generation).await;
        }

        rx.await.unwrap_or(Err(LinkError::ChannelClosed))
    }

    async fn request(
        &self,
        envelope: RequestEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let message = envelope.to_value()?;
        self.inner
            .correlator
            .send(envelope.id, || self.post(message), cancel)
            .await
    }

    async fn disconnect(&self) {
        let (window, waiters, task) = {
            let mut slot = self.inner.lock();
            slot.generation += 1;
            slot.phase = PopupState::Idle;
            slot.buffer.clear();
            (
                slot.window.take(),
                std::mem::take(&mut slot.waiters),
                slot.events_task.take(),
            )
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(window) = window {
            window.close().await;
        }
        for waiter in waiters {
            let _ = waiter.send(Err(LinkError::ChannelClosed));
        }
        self.inner.correlator.reject_all(&LinkError::ChannelClosed);
        self.inner.state.reset();
        log::info!("[Popup] Disconnected");
    }

    fn mark_linked(&self) {
        self.inner.state.set_linked(true);
        if self.inner.state.is_connected() {
            self.inner.state.set(ConnectionState::Linked);
        }
    }

    fn state(&self) -> &SharedConnectionState {
        &self.inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct RecordingWindow {
        posted: Mutex<Vec<Value>>,
        /// Park the first post until `release` is notified.
        hold_first: bool,
        calls: AtomicUsize,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl PopupWindow for RecordingWindow {
        async fn post_message(&self, message: Value) -> Result<()> {
            if self.hold_first && self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.posted.lock().unwrap().push(message);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[derive(Debug, Default)]
    struct FakeHost {
        opens: AtomicUsize,
        window: Arc<RecordingWindow>,
        events: Mutex<Option<mpsc::Sender<PopupEvent>>>,
    }

    #[async_trait]
    impl PopupHost for FakeHost {
        async fn open(&self, _url: &Url) -> Result<OpenedPopup> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            *self.events.lock().unwrap() = Some(tx);
            Ok(OpenedPopup {
                window: self.window.clone(),
                events: rx,
            })
        }
    }

    impl FakeHost {
        async fn emit(&self, event: PopupEvent) {
            let tx = self.events.lock().unwrap().clone().unwrap();
            tx.send(event).await.unwrap();
        }

        async fn ready(&self) {
            self.emit(PopupEvent::Message {
                origin: "https://wallet.example".into(),
                data: serde_json::json!({"type": POPUP_READY_TYPE}),
            })
            .await;
        }
    }

    fn channel(host: &Arc<FakeHost>) -> PopupChannel {
        PopupChannel::new(
            host.clone(),
            Url::parse("https://wallet.example/connect").unwrap(),
            RequestCorrelator::default(),
        )
    }

    async fn wait_for_opening(host: &FakeHost) {
        while host.events.lock().unwrap().is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_waits_for_ready() {
        let host = Arc::new(FakeHost::default());
        let popup = channel(&host);

        let connecting = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        assert_ne!(popup.popup_state(), PopupState::Open);

        host.ready().await;
        connecting.await.unwrap().unwrap();
        assert_eq!(popup.popup_state(), PopupState::Open);
        assert!(popup.state().is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_connects_open_one_window() {
        let host = Arc::new(FakeHost::default());
        let popup = channel(&host);

        let a = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        let b = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        host.ready().await;

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        popup.connect().await.unwrap();
        assert_eq!(host.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_messages_buffer_until_ready() {
        let host = Arc::new(FakeHost::default());
        let popup = channel(&host);

        popup.post(serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(popup.buffered(), 1);
        assert!(host.window.posted.lock().unwrap().is_empty());

        let connecting = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        host.ready().await;
        connecting.await.unwrap().unwrap();

        assert_eq!(popup.buffered(), 0);
        assert_eq!(*host.window.posted.lock().unwrap(), vec![serde_json::json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_post_during_flush_keeps_order() {
        let host = Arc::new(FakeHost {
            window: Arc::new(RecordingWindow {
                hold_first: true,
                ..RecordingWindow::default()
            }),
            ..FakeHost::default()
        });
        let popup = channel(&host);
        popup.post(serde_json::json!({"n": 1})).await.unwrap();

        let connecting = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        host.ready().await;
        host.window.entered.notified().await;

        popup.post(serde_json::json!({"n": 2})).await.unwrap();
        assert_ne!(popup.popup_state(), PopupState::Open);
        host.window.release.notify_one();
        connecting.await.unwrap().unwrap();

        assert_eq!(
            *host.window.posted.lock().unwrap(),
            vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]
        );
        assert_eq!(popup.buffered(), 0);
    }

    #[tokio::test]
    async fn test_user_close_before_ready_fails_connect() {
        let host = Arc::new(FakeHost::default());
        let popup = channel(&host);

        let connecting = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        host.emit(PopupEvent::Closed).await;

        assert_eq!(connecting.await.unwrap(), Err(LinkError::UserClosedChannel));
        assert_eq!(popup.popup_state(), PopupState::Closed);
    }

    #[tokio::test]
    async fn test_foreign_origin_ready_is_ignored() {
        let host = Arc::new(FakeHost::default());
        let popup = channel(&host);

        let connecting = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        host.emit(PopupEvent::Message {
            origin: "https://evil.example".into(),
            data: serde_json::json!({"type": POPUP_READY_TYPE}),
        })
        .await;
        tokio::task::yield_now().await;
        assert_ne!(popup.popup_state(), PopupState::Open);

        host.ready().await;
        connecting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_resets_to_idle() {
        let host = Arc::new(FakeHost::default());
        let popup = channel(&host);
        let connecting = tokio::spawn({
            let popup = popup.clone();
            async move { popup.connect().await }
        });
        wait_for_opening(&host).await;
        host.ready().await;
        connecting.await.unwrap().unwrap();

        popup.disconnect().await;

        assert_eq!(popup.popup_state(), PopupState::Idle);
        assert!(!popup.state().is_connected());
    }
}
