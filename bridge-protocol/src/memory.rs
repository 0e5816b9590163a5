//! # In-Process Transports
//!
//! Memory implementations of every transport model, used by tests and by
//! hosts that run both sides in one process:
//!
//! - [`MemoryChannel::worker`]: structured, no origin
//! - [`MemoryChannel::window`]: structured, explicit target origin
//! - [`MemoryPortHub`]: text relay ports with a connect/disconnect lifecycle
//!
//! Each endpoint delivers inbound frames from its own pump task, so delivery
//! is asynchronous and ordered, like a browser event loop. Endpoints must be
//! created inside a tokio runtime.

use crate::transport::{
    Carrier, ConnectListener, DisconnectSignal, Frame, Inbound, Listener, ListenerId, Listeners,
    Port, PortAcceptor, PortOpener, Transport, TransportError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Wildcard target origin: deliver whatever the receiver's origin is.
pub const ANY_ORIGIN: &str = "*";

/// One end of an in-memory structured channel.
pub struct MemoryEndpoint {
    /// Origin stamped on frames this endpoint sends.
    origin: Option<String>,
    /// Origin of the other end, checked against `target_origin`.
    peer_origin: Option<String>,
    window: bool,
    peer: mpsc::UnboundedSender<Inbound>,
    listeners: Arc<Listeners<Inbound>>,
    pump: JoinHandle<()>,
}

/// Constructors for connected endpoint pairs.
pub struct MemoryChannel;

impl MemoryChannel {
    /// A worker-like pair: structured frames, no origins.
    pub fn worker() -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
        pair(None, None, false)
    }

    /// A window-like pair. Posts must name the receiver's origin (or `*`);
    /// frames carry the sender's origin.
    pub fn window(
        origin_a: impl Into<String>,
        origin_b: impl Into<String>,
    ) -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
        pair(Some(origin_a.into()), Some(origin_b.into()), true)
    }
}

fn pair(
    origin_a: Option<String>,
    origin_b: Option<String>,
    window: bool,
) -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
    let (to_a, rx_a) = mpsc::unbounded_channel();
    let (to_b, rx_b) = mpsc::unbounded_channel();
    let a = MemoryEndpoint::spawn(origin_a.clone(), origin_b.clone(), window, to_b, rx_a);
    let b = MemoryEndpoint::spawn(origin_b, origin_a, window, to_a, rx_b);
    (Arc::new(a), Arc::new(b))
}

/// Drains `inbox` into `listeners` until every sender is gone.
fn spawn_pump(
    listeners: Arc<Listeners<Inbound>>,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(inbound) = inbox.recv().await {
            listeners.emit(inbound);
        }
    })
}

impl MemoryEndpoint {
    fn spawn(
        origin: Option<String>,
        peer_origin: Option<String>,
        window: bool,
        peer: mpsc::UnboundedSender<Inbound>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        let listeners = Arc::new(Listeners::new());
        let pump = spawn_pump(listeners.clone(), inbox);
        Self {
            origin,
            peer_origin,
            window,
            peer,
            listeners,
            pump,
        }
    }
}

impl Transport for MemoryEndpoint {
    fn carrier(&self) -> Carrier {
        Carrier::Structured
    }

    fn requires_target_origin(&self) -> bool {
        self.window
    }

    fn post(&self, frame: Frame, target_origin: Option<&str>) -> Result<(), TransportError> {
        if self.window {
            // A window silently drops frames addressed to another origin.
            let target = target_origin.unwrap_or(ANY_ORIGIN);
            if target != ANY_ORIGIN && Some(target) != self.peer_origin.as_deref() {
                debug!(target, "dropping frame for mismatched origin");
                return Ok(());
            }
        }
        let inbound = Inbound {
            frame,
            origin: self.origin.clone(),
        };
        self.peer
            .send(inbound)
            .map_err(|_| TransportError::Disconnected)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ─── Relay Ports ────────────────────────────────────────────────

/// One end of an in-memory relay port. Both ends share one disconnect
/// signal: disconnecting either end notifies subscribers on both.
pub struct MemoryPort {
    name: String,
    sender_url: Option<String>,
    peer: mpsc::UnboundedSender<Inbound>,
    listeners: Arc<Listeners<Inbound>>,
    signal: Arc<DisconnectSignal>,
    pump: JoinHandle<()>,
}

impl MemoryPort {
    /// Creates a connected pair. `sender_url` is what the second end reports
    /// as the URL of the first end.
    pub fn pair(name: &str, sender_url: Option<String>) -> (Arc<MemoryPort>, Arc<MemoryPort>) {
        let (to_a, rx_a) = mpsc::unbounded_channel();
        let (to_b, rx_b) = mpsc::unbounded_channel();
        let signal = Arc::new(DisconnectSignal::default());
        let a = MemoryPort::spawn(name, None, to_b, rx_a, signal.clone());
        let b = MemoryPort::spawn(name, sender_url, to_a, rx_b, signal);
        (Arc::new(a), Arc::new(b))
    }

    fn spawn(
        name: &str,
        sender_url: Option<String>,
        peer: mpsc::UnboundedSender<Inbound>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        signal: Arc<DisconnectSignal>,
    ) -> Self {
        let listeners = Arc::new(Listeners::new());
        let pump = spawn_pump(listeners.clone(), inbox);
        Self {
            name: name.to_owned(),
            sender_url,
            peer,
            listeners,
            signal,
            pump,
        }
    }
}

impl Transport for MemoryPort {
    fn carrier(&self) -> Carrier {
        Carrier::Text
    }

    fn post(&self, frame: Frame, _target_origin: Option<&str>) -> Result<(), TransportError> {
        if self.signal.is_fired() {
            return Err(TransportError::Disconnected);
        }
        let text = frame.into_text()?;
        self.peer
            .send(Inbound::new(Frame::Text(text)))
            .map_err(|_| TransportError::Disconnected)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn sender_url(&self) -> Option<&str> {
        self.sender_url.as_deref()
    }

    fn on_disconnect(&self, callback: Box<dyn FnOnce() + Send>) {
        self.signal.subscribe(callback);
    }

    fn disconnect(&self) {
        if self.signal.fire() {
            debug!(port = %self.name, "memory port disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        !self.signal.is_fired()
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// An in-memory port registry: [`PortOpener::open`] creates a port pair and
/// announces the far end to every connect listener.
pub struct MemoryPortHub {
    sender_url: Option<String>,
    connect_listeners: Listeners<Arc<dyn Port>>,
}

impl MemoryPortHub {
    pub fn new() -> Self {
        Self {
            sender_url: None,
            connect_listeners: Listeners::new(),
        }
    }

    /// Ports opened through this hub report `url` as their sender URL on
    /// the accepting side.
    pub fn with_sender_url(url: impl Into<String>) -> Self {
        Self {
            sender_url: Some(url.into()),
            connect_listeners: Listeners::new(),
        }
    }

    /// Opens a port without going through the async trait.
    pub fn connect(&self, name: &str) -> Arc<MemoryPort> {
        let (local, remote) = MemoryPort::pair(name, self.sender_url.clone());
        self.connect_listeners.emit(remote);
        local
    }
}

impl Default for MemoryPortHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortOpener for MemoryPortHub {
    async fn open(&self, name: &str) -> Result<Arc<dyn Port>, TransportError> {
        Ok(self.connect(name))
    }
}

impl PortAcceptor for MemoryPortHub {
    fn add_connect_listener(&self, listener: ConnectListener) -> ListenerId {
        self.connect_listeners.add(listener)
    }

    fn remove_connect_listener(&self, id: ListenerId) {
        self.connect_listeners.remove(id);
    }
}
