//! # Port Reconnection Adapter
//!
//! Keeps a [`Connector`] attached to a relay port that can die at any time.
//! A supervisor task drives the state machine:
//!
//! ```text
//! Disconnected ──▶ Connecting ──open ok──▶ Connected
//!      ▲               │                      │
//!      │          open failed            port closed
//!      │        (wait and retry)              │
//!      └──────────────────────────────────────┘
//! ```
//!
//! On every successful open the connector's transport is swapped to the new
//! port and the last `init` arguments are replayed. Requests made while no
//! port is attached fail synchronously; nothing is buffered.

use crate::config::PortAdapterConfig;
use crate::connector::{Connector, Handlers, PendingResponse, Request};
use crate::error::ConnectorError;
use crate::state::ProgressCallback;
use bridge_protocol::{Carrier, Detached, Port, PortOpener, Transport, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disconnected,
    Connecting,
    Connected,
}

/// `init` arguments and whether a port is attached. Kept under one lock so
/// an `init` racing a reconnect is never skipped: either it sees the port
/// and sends, or the replay picks up its args.
#[derive(Default)]
struct Session {
    init_args: Option<Vec<Value>>,
    connected: bool,
}

struct Shared {
    connector: Connector,
    session: Mutex<Session>,
    port: Mutex<Option<Arc<dyn Port>>>,
    state: watch::Sender<PortState>,
}

impl Shared {
    fn current_port(&self) -> Option<Arc<dyn Port>> {
        self.port.lock().clone()
    }

    /// Reacts to a failed send: a dead port is disconnected explicitly so the
    /// supervisor reopens it. The port's disconnect signal fires only once,
    /// which bounds this to one reconnect per port.
    fn on_send_error(&self, used: Option<&Arc<dyn Port>>, err: &ConnectorError) {
        if !err.is_disconnect() {
            return;
        }
        if let Some(port) = used {
            warn!(port = port.name(), "send failed on a dead port, reconnecting");
            port.disconnect();
        }
    }
}

/// A connector over relay ports that reconnects by itself.
pub struct PortAdapter {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl PortAdapter {
    /// Creates the connector and spawns the supervisor. Must be called inside
    /// a tokio runtime.
    pub fn spawn(
        opener: Arc<dyn PortOpener>,
        config: PortAdapterConfig,
        handlers: Handlers,
    ) -> Self {
        let connector = Connector::with_handlers(
            Arc::new(Detached::new(Carrier::Text)),
            config.connector.clone(),
            handlers,
        );
        let (state, _) = watch::channel(PortState::Disconnected);
        let shared = Arc::new(Shared {
            connector,
            session: Mutex::new(Session::default()),
            port: Mutex::new(None),
            state,
        });
        let supervisor = tokio::spawn(run_port_loop(
            shared.clone(),
            opener,
            config.port_name,
            config.reconnect_delay,
        ));
        Self { shared, supervisor }
    }

    /// Remembers `args` for replay on every future connection and sends them
    /// now if a port is attached.
    pub fn init(&self, args: Vec<Value>) -> Result<(), ConnectorError> {
        let send_now = {
            let mut session = self.shared.session.lock();
            session.init_args = Some(args.clone());
            session.connected
        };
        if !send_now {
            return Ok(());
        }
        let port = self.shared.current_port();
        self.shared
            .connector
            .init(args)
            .inspect_err(|e| self.shared.on_send_error(port.as_ref(), e))
    }

    /// Sends a call on the current port. A send that fails because the port
    /// died disconnects it, which makes the supervisor reopen it.
    pub fn request(&self, request: Request) -> Result<PendingResponse, ConnectorError> {
        let port = self.shared.current_port();
        self.shared
            .connector
            .request(request)
            .inspect_err(|e| self.shared.on_send_error(port.as_ref(), e))
    }

    /// Cancels streamed progress. See [`Connector::cancel_callback`].
    pub fn cancel_callback(&self, callback: &ProgressCallback) -> Result<(), ConnectorError> {
        let port = self.shared.current_port();
        self.shared
            .connector
            .cancel_callback(callback)
            .inspect_err(|e| self.shared.on_send_error(port.as_ref(), e))
    }

    pub fn state(&self) -> PortState {
        *self.shared.state.borrow()
    }

    /// Every state transition, starting from the current one.
    pub fn state_changes(&self) -> watch::Receiver<PortState> {
        self.shared.state.subscribe()
    }

    /// Resolves once a port is attached.
    pub async fn wait_connected(&self) {
        let mut changes = self.state_changes();
        let _ = changes.wait_for(|state| *state == PortState::Connected).await;
    }

    /// The connector behind the adapter. Its transport changes over time.
    pub fn connector(&self) -> &Connector {
        &self.shared.connector
    }

    /// Stops reconnecting, disconnects the current port and destroys the
    /// connector.
    pub fn shutdown(&self) {
        self.supervisor.abort();
        if let Some(port) = self.shared.port.lock().take() {
            port.disconnect();
        }
        self.shared.session.lock().connected = false;
        self.shared.state.send_replace(PortState::Disconnected);
        self.shared.connector.destroy();
    }
}

impl Drop for PortAdapter {
    fn drop(&mut self) {
        self.supervisor.abort();
        if let Some(port) = self.shared.port.lock().take() {
            port.disconnect();
        }
    }
}

// ─── Supervisor Loop ────────────────────────────────────────────

/// Opens, serves and reopens the relay port until aborted.
async fn run_port_loop(
    shared: Arc<Shared>,
    opener: Arc<dyn PortOpener>,
    port_name: String,
    reconnect_delay: Duration,
) {
    loop {
        shared.state.send_replace(PortState::Connecting);
        info!("Opening port: {}", port_name);

        match opener.open(&port_name).await {
            Ok(port) => {
                let (closed_tx, closed_rx) = oneshot::channel();
                port.on_disconnect(Box::new(move || {
                    let _ = closed_tx.send(());
                }));

                let transport: Arc<dyn Transport> = port.clone();
                shared.connector.replace_transport(transport);
                *shared.port.lock() = Some(port);

                let replay = {
                    let mut session = shared.session.lock();
                    session.connected = true;
                    session.init_args.clone()
                };
                shared.state.send_replace(PortState::Connected);
                info!("Port connected: {}", port_name);

                if let Some(args) = replay {
                    if let Err(e) = shared.connector.init(args) {
                        warn!("Failed to replay init on {}: {}", port_name, e);
                    }
                }

                // Resolves on disconnect, or with an error if the port was
                // dropped without ever firing its signal.
                let _ = closed_rx.await;

                shared.session.lock().connected = false;
                shared.port.lock().take();
                shared
                    .connector
                    .replace_transport(Arc::new(Detached::new(Carrier::Text)));
                shared.state.send_replace(PortState::Disconnected);
                warn!("Port disconnected: {}", port_name);
                shared.connector.handle_transport_loss();

                // Reopen right away; only failed opens back off.
                continue;
            }
            Err(e) => {
                error!("Failed to open port {}: {}", port_name, e);
                shared.state.send_replace(PortState::Disconnected);
            }
        }

        info!("Reopening port in {:?}...", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
    }
}
