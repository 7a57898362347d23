//! Request/response correlation across an asynchronous transport.
//!
//! Every outbound request registers its id and receives a
//! [`PendingResponse`] backed by a `oneshot` channel. The channel's read
//! loop calls [`RequestCorrelator::resolve`] / [`RequestCorrelator::reject`]
//! as replies arrive; the oneshot sender is the single resolution site, so
//! each request completes exactly once.
//!
//! # Lifecycle
//!
//! ```text
//! register(id) ──▶ pending ──resolve/reject/reject_all──▶ retired
//!                     │
//!                     └──timeout / cancel / drop──────────▶ retired
//! ```
//!
//! Retired ids are remembered (bounded) so late or duplicated responses
//! are dropped and an id can never be registered twice.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::ResponseEnvelope;
use crate::error::{LinkError, Result};

/// Default bound on how long a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Retired ids remembered before the oldest are forgotten.
const RETIRED_CAPACITY: usize = 1024;

type Resolver<T> = oneshot::Sender<Result<T>>;

struct State<T> {
    pending: HashMap<Uuid, Resolver<T>>,
    retired: HashSet<Uuid>,
    retired_order: VecDeque<Uuid>,
}

impl<T> State<T> {
    fn retire(&mut self, id: Uuid) {
        if self.retired.insert(id) {
            self.retired_order.push_back(id);
            if self.retired_order.len() > RETIRED_CAPACITY {
                if let Some(oldest) = self.retired_order.pop_front() {
                    self.retired.remove(&oldest);
                }
            }
        }
    }

    fn take(&mut self, id: Uuid) -> Option<Resolver<T>> {
        let resolver = self.pending.remove(&id)?;
        self.retire(id);
        Some(resolver)
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    timeout: Duration,
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Matches responses to pending requests by id.
///
/// Cheap to clone; clones share the same pending table.
pub struct RequestCorrelator<T = ResponseEnvelope> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RequestCorrelator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for RequestCorrelator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .field("timeout", &self.shared.timeout)
            .finish()
    }
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl<T> RequestCorrelator<T> {
    /// Create a correlator whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: HashMap::new(),
                    retired: HashSet::new(),
                    retired_order: VecDeque::new(),
                }),
                timeout,
            }),
        }
    }

    /// Start tracking `id`. Refuses ids that are pending or already retired.
    pub fn register(&self, id: Uuid) -> Result<PendingResponse<T>> {
        let mut state = self.shared.lock();
        if state.pending.contains_key(&id) || state.retired.contains(&id) {
            return Err(LinkError::protocol(format!("duplicate request id {id}")));
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        log::trace!("[Correlator] Registered {id} ({} pending)", state.pending.len());
        Ok(PendingResponse {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Register `id`, run `transmit`, then wait for the response.
    ///
    /// Registration happens before transmission so an immediate reply is
    /// never missed. A transmit failure retires the id and is returned as-is.
    pub async fn send<F, Fut>(&self, id: Uuid, transmit: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let pending = self.register(id)?;
        transmit().await?;
        pending.wait(cancel).await
    }

    /// Complete `request_id` successfully. `false` if it is not pending.
    pub fn resolve(&self, request_id: Uuid, response: T) -> bool {
        self.complete(request_id, Ok(response))
    }

    /// Fail `request_id`. `false` if it is not pending.
    pub fn reject(&self, request_id: Uuid, error: LinkError) -> bool {
        self.complete(request_id, Err(error))
    }

    fn complete(&self, request_id: Uuid, outcome: Result<T>) -> bool {
        let resolver = self.shared.lock().take(request_id);
        match resolver {
            Some(tx) => {
                // The waiter may have gone away between take and send.
                let _ = tx.send(outcome);
                true
            }
            None => {
                log::debug!("[Correlator] Dropping response for unknown request {request_id}");
                false
            }
        }
    }

    /// Fail every pending request with `error`. Returns how many were pending.
    pub fn reject_all(&self, error: &LinkError) -> usize {
        let drained: Vec<(Uuid, Resolver<T>)> = {
            let mut state = self.shared.lock();
            let drained: Vec<_> = state.pending.drain().collect();
            for (id, _) in &drained {
                state.retire(*id);
            }
            drained
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        if count > 0 {
            log::info!("[Correlator] Rejected {count} pending request(s): {error}");
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Whether `id` is awaiting a response.
    pub fn is_pending(&self, id: Uuid) -> bool {
        self.shared.lock().pending.contains_key(&id)
    }

    /// Configured response bound.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }
}

/// Caller-side handle for one pending request.
///
/// Dropping it without waiting retires the id.
pub struct PendingResponse<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T>>,
    shared: Arc<Shared<T>>,
}

impl<T> std::fmt::Debug for PendingResponse<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T> PendingResponse<T> {
    /// Request id this handle waits on.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the response, the timeout, or cancellation, whichever comes first.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<T> {
        let timeout = self.shared.timeout;
        tokio::select! {
            outcome = &mut self.rx => outcome.unwrap_or(Err(LinkError::ChannelClosed)),
            () = tokio::time::sleep(timeout) => {
                log::warn!("[Correlator] Request {} timed out after {:?}", self.id, timeout);
                Err(LinkError::Timeout)
            }
            () = cancel.cancelled() => {
                log::debug!("[Correlator] Request {} cancelled by caller", self.id);
                Err(LinkError::Cancelled)
            }
        }
    }
}

impl<T> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.pending.remove(&self.id).is_some() {
            state.retire(self.id);
        }
    }
}
