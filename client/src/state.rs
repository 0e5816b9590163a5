//! # Call State
//!
//! Per-connector tracking tables:
//! - [`CallTable`]: pending calls keyed by message id, plus the streaming
//!   callback registrations that let `cancel_callback` find a call from the
//!   callback alone
//! - [`ProgressCallback`]: a caller-supplied streaming callback with a
//!   stable identity
//!
//! Every table belongs to exactly one connector and is dropped with it.

use crate::error::CallError;
use bridge_protocol::{MessageId, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Identity of a [`ProgressCallback`]. Clones share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Streaming progress callback passed along with a request.
///
/// The callback is identified by the value returned from [`Self::id`], so
/// the same handle (or a clone of it) is what `cancel_callback` expects.
#[derive(Clone)]
pub struct ProgressCallback {
    id: CallbackId,
    f: Arc<dyn Fn(Vec<Value>) + Send + Sync>,
}

impl ProgressCallback {
    pub fn new(f: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self {
            id: CallbackId::next(),
            f: Arc::new(f),
        }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub(crate) fn invoke(&self, args: Vec<Value>) {
        (self.f)(args);
    }
}

impl fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressCallback").field("id", &self.id).finish()
    }
}

pub(crate) type Settle = oneshot::Sender<Result<Value, CallError>>;

/// A call waiting for its `methodResponse`.
pub(crate) struct PendingCall {
    pub settle: Settle,
    pub progress: Option<ProgressCallback>,
}

struct Registration {
    message_id: MessageId,
    canceled: bool,
}

#[derive(Default)]
pub(crate) struct CallTable {
    calls: HashMap<MessageId, PendingCall>,
    callbacks: HashMap<CallbackId, Registration>,
}

impl CallTable {
    /// Tracks a call, and its callback registration when it streams
    /// progress.
    pub fn insert(&mut self, message_id: MessageId, call: PendingCall) {
        if let Some(progress) = &call.progress {
            self.callbacks.insert(
                progress.id(),
                Registration {
                    message_id: message_id.clone(),
                    canceled: false,
                },
            );
        }
        self.calls.insert(message_id, call);
    }

    /// Removes a call together with its callback registration.
    pub fn take(&mut self, message_id: &str) -> Option<PendingCall> {
        let call = self.calls.remove(message_id)?;
        if let Some(progress) = &call.progress {
            self.callbacks.remove(&progress.id());
        }
        Some(call)
    }

    /// The streaming callback of a call, unless it was canceled.
    pub fn progress_for(&self, message_id: &str) -> Option<ProgressCallback> {
        let progress = self.calls.get(message_id)?.progress.as_ref()?;
        let registration = self.callbacks.get(&progress.id())?;
        (!registration.canceled).then(|| progress.clone())
    }

    /// Marks a callback canceled. Returns the message id the first time only.
    pub fn cancel(&mut self, id: CallbackId) -> Option<MessageId> {
        let registration = self.callbacks.get_mut(&id)?;
        if registration.canceled {
            return None;
        }
        registration.canceled = true;
        Some(registration.message_id.clone())
    }

    /// Undoes [`Self::cancel`] after the `cancelProgress` could not be sent.
    pub fn restore(&mut self, id: CallbackId) {
        if let Some(registration) = self.callbacks.get_mut(&id) {
            registration.canceled = false;
        }
    }

    /// Removes every call and registration, for rejection or teardown.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.callbacks.clear();
        self.calls.drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
