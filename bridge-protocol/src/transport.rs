//! # Transport Contract
//!
//! The connector and the dispatcher never touch a concrete channel. They
//! talk to an injected [`Transport`] (`post`, `add_listener`,
//! `remove_listener`), which covers the three physical models:
//!
//! - window-like duplex channels: structured values, explicit target origin
//! - worker-like channels: structured values, no origin
//! - relay ports ([`Port`]): text only, explicit connect/disconnect lifecycle
//!
//! Ports are opened by a [`PortOpener`] (active side) and announced by a
//! [`PortAcceptor`] (passive side).

use crate::codec::{self, CodecError};
use crate::message::Envelope;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a transport can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    /// Envelopes are passed as values, buffers can be transferred.
    Structured,
    /// Envelopes must be encoded with [`codec::encode`].
    Text,
}

/// One unit handed to a transport.
#[derive(Debug, Clone)]
pub enum Frame {
    Structured {
        envelope: Envelope,
        /// Buffers moved to the receiver instead of copied.
        transfer: Vec<Bytes>,
    },
    Text(String),
}

impl Frame {
    /// Builds the frame a transport with `carrier` expects.
    pub fn for_carrier(
        carrier: Carrier,
        envelope: Envelope,
        transfer: Vec<Bytes>,
    ) -> Result<Self, CodecError> {
        match carrier {
            Carrier::Structured => Ok(Frame::Structured { envelope, transfer }),
            Carrier::Text => Ok(Frame::Text(codec::encode(&envelope)?)),
        }
    }

    /// Decodes the frame if it arrived as text.
    pub fn into_envelope(self) -> Result<Envelope, CodecError> {
        match self {
            Frame::Structured { envelope, .. } => Ok(envelope),
            Frame::Text(text) => codec::decode(&text),
        }
    }

    /// Encodes the frame if it is still structured.
    pub fn into_text(self) -> Result<String, CodecError> {
        match self {
            Frame::Structured { envelope, .. } => codec::encode(&envelope),
            Frame::Text(text) => Ok(text),
        }
    }
}

/// A frame received from a transport, with the sender's origin when the
/// transport knows it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub frame: Frame,
    pub origin: Option<String>,
}

impl Inbound {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            origin: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected yet")]
    NotConnected,

    #[error("port disconnected")]
    Disconnected,

    #[error("failed to open port `{name}`: {reason}")]
    Open { name: String, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub type Listener = Arc<dyn Fn(Inbound) + Send + Sync>;

/// A physical channel to another context.
pub trait Transport: Send + Sync {
    fn carrier(&self) -> Carrier;

    /// `true` for window-like targets, which need an explicit recipient
    /// origin on every post.
    fn requires_target_origin(&self) -> bool {
        false
    }

    /// Sends a frame. Fails synchronously when the channel is gone.
    fn post(&self, frame: Frame, target_origin: Option<&str>) -> Result<(), TransportError>;

    fn add_listener(&self, listener: Listener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// Encodes `envelope` for `transport` and posts it.
pub fn post_envelope(
    transport: &dyn Transport,
    envelope: Envelope,
    transfer: Vec<Bytes>,
    target_origin: Option<&str>,
) -> Result<(), TransportError> {
    let frame = Frame::for_carrier(transport.carrier(), envelope, transfer)?;
    transport.post(frame, target_origin)
}

/// A named, text-only transport that can be disconnected by either side.
pub trait Port: Transport {
    fn name(&self) -> &str;

    /// URL of the context on the other end, when known.
    fn sender_url(&self) -> Option<&str>;

    /// Runs `callback` once the port disconnects. Runs it immediately if the
    /// port is already gone.
    fn on_disconnect(&self, callback: Box<dyn FnOnce() + Send>);

    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Opens relay ports by name.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn Port>, TransportError>;
}

pub type ConnectListener = Arc<dyn Fn(Arc<dyn Port>) + Send + Sync>;

/// Announces ports opened by other contexts.
pub trait PortAcceptor: Send + Sync {
    fn add_connect_listener(&self, listener: ConnectListener) -> ListenerId;

    fn remove_connect_listener(&self, id: ListenerId);
}

// ─── Building Blocks ────────────────────────────────────────────

/// A listener registry. Listeners are called outside the lock, in
/// registration order.
pub struct Listeners<E> {
    entries: Mutex<Vec<(ListenerId, Arc<dyn Fn(E) + Send + Sync>)>>,
}

impl<E: Clone> Listeners<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn Fn(E) + Send + Sync>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    pub fn emit(&self, event: E) {
        let snapshot: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event.clone());
        }
    }
}

impl<E: Clone> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot disconnect notification shared by port implementations.
#[derive(Default)]
pub struct DisconnectSignal {
    state: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    fired: bool,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl DisconnectSignal {
    pub fn subscribe(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut state = self.state.lock();
        if state.fired {
            drop(state);
            callback();
        } else {
            state.callbacks.push(callback);
        }
    }

    /// Fires every subscriber. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }
}

/// Placeholder transport for a connector that has nothing to talk to yet.
/// Every post fails with [`TransportError::NotConnected`].
#[derive(Debug)]
pub struct Detached {
    carrier: Carrier,
}

impl Detached {
    pub fn new(carrier: Carrier) -> Self {
        Self { carrier }
    }
}

impl Transport for Detached {
    fn carrier(&self) -> Carrier {
        self.carrier
    }

    fn post(&self, _frame: Frame, _target_origin: Option<&str>) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn add_listener(&self, _listener: Listener) -> ListenerId {
        ListenerId::next()
    }

    fn remove_listener(&self, _id: ListenerId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn disconnect_signal_fires_once_and_late_subscribers_run_immediately() {
        let signal = DisconnectSignal::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        signal.subscribe(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(signal.fire());
        assert!(!signal.fire());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        signal.subscribe(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_listeners_are_not_called() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let first = listeners.add(Arc::new(move |n| s.lock().push(("first", n))));
        let s = seen.clone();
        listeners.add(Arc::new(move |n| s.lock().push(("second", n))));

        listeners.emit(1);
        listeners.remove(first);
        listeners.emit(2);

        assert_eq!(*seen.lock(), vec![("first", 1), ("second", 1), ("second", 2)]);
    }

    #[test]
    fn detached_transport_refuses_to_send() {
        let detached = Detached::new(Carrier::Text);
        let err = detached.post(Frame::Text("{}".into()), None).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
