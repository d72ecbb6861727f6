//! A cloneable handle on a socket transport's shared state.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, Ordering},
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::transport::{ConnectionState, ErrorCallback};

/// A cloneable handle shared between a transport and its connection task.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct TransportHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) pending: Arc<Mutex<VecDeque<String>>>,
    pub(crate) flush_notify: Arc<tokio::sync::Notify>,
    state: Arc<AtomicU8>,
    generation: Arc<AtomicU64>,
    max_pending: usize,
    on_error: Option<ErrorCallback>,
}

impl TransportHandle {
    pub(crate) fn new(max_pending: usize, on_error: Option<ErrorCallback>) -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            flush_notify: Arc::new(tokio::sync::Notify::new()),
            state: Arc::new(AtomicU8::new(ConnectionState::Closed as u8)),
            generation: Arc::new(AtomicU64::new(0)),
            max_pending: max_pending.max(1),
            on_error,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of outbound frames waiting for an open socket
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a serialized frame and wake the connection task.
    pub fn enqueue(&self, text: String) {
        let mut q = self.pending.lock();
        if q.len() >= self.max_pending {
            tracing::warn!("Outbound queue full ({} frames), dropping oldest", self.max_pending);
            q.pop_front();
        }
        q.push_back(text);
        drop(q);
        self.flush_notify.notify_one();
    }

    pub(crate) fn pop_pending(&self) -> Option<String> {
        self.pending.lock().pop_front()
    }

    /// Put back a frame that failed to send so it goes out first next time
    pub(crate) fn requeue_front(&self, text: String) {
        let mut q = self.pending.lock();
        if q.len() >= self.max_pending {
            tracing::warn!("Outbound queue full ({} frames), dropping oldest", self.max_pending);
            return;
        }
        q.push_front(text);
    }

    /// Retire the current connection task and start a new generation.
    ///
    /// Returns the generation id and the token the new task must watch.
    pub(crate) fn begin_generation(&self) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        let mut current = self.cancel.lock();
        current.cancel();
        *current = token.clone();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state
            .store(ConnectionState::Connecting as u8, Ordering::Release);
        (generation, token)
    }

    /// Record a state change from the task owning `generation`.
    ///
    /// Writes from a retired task are ignored. Returns whether the write landed.
    pub(crate) fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let _guard = self.cancel.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.state.store(state as u8, Ordering::Release);
        true
    }

    /// Stop the connection task. Queued frames stay queued.
    pub fn cancel(&self) {
        let current = self.cancel.lock();
        current.cancel();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Log a transport failure and hand it to the error callback, if any
    pub(crate) fn report(&self, error: &Error) {
        tracing::warn!("Transport error: {}", error);
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }
}
