//! # Serving Method Tables over Relay Ports
//!
//! Two ways to expose a [`MethodTable`] on relay ports:
//! - [`serve_ports`]: passive. Every port opened with the configured name
//!   gets its own dispatcher, bound to the caller origin resolved from the
//!   port's sender URL.
//! - [`serve_reverse_port`]: active. The callee opens the port itself and
//!   reopens it whenever it disconnects.

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::outbox::UpdateSender;
use crate::table::MethodTable;
use bridge_protocol::{ListenerId, Port, PortAcceptor, PortOpener, Transport};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

/// Called with the update sender of a port that just disconnected, so
/// subscriptions registered for it can be dropped.
pub type DisconnectHook = Arc<dyn Fn(UpdateSender) + Send + Sync>;

/// How [`serve_ports`] sets up each accepted port.
#[derive(Clone, Default)]
pub struct ServeOptions {
    pub config: DispatcherConfig,
    /// Run the `init` entry with no args as soon as a port connects.
    pub auto_init: bool,
    pub on_disconnect: Option<DisconnectHook>,
}

impl ServeOptions {
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_auto_init(mut self, auto_init: bool) -> Self {
        self.auto_init = auto_init;
        self
    }

    /// Runs `f` after a served port disconnects and its dispatcher is gone.
    pub fn on_disconnect(mut self, f: impl Fn(UpdateSender) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }
}

/// `scheme://host[:port]` of `url`, or `None` for opaque or invalid URLs.
pub fn origin_of(url: &str) -> Option<String> {
    let origin = Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Handle to a running [`serve_ports`]. Dropping it stops accepting ports;
/// ports already served keep running until they disconnect.
pub struct PortService {
    acceptor: Arc<dyn PortAcceptor>,
    listener: ListenerId,
    sessions: Arc<DashMap<String, Dispatcher>>,
}

impl PortService {
    /// Number of ports currently served.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Drop for PortService {
    fn drop(&mut self) {
        self.acceptor.remove_connect_listener(self.listener);
    }
}

/// Serves `table` on every port named `port_name` that `acceptor` accepts,
/// one [`Dispatcher`] per port, until the returned service is dropped.
pub fn serve_ports(
    acceptor: Arc<dyn PortAcceptor>,
    port_name: impl Into<String>,
    table: Arc<MethodTable>,
    options: ServeOptions,
) -> PortService {
    let port_name = port_name.into();
    let sessions: Arc<DashMap<String, Dispatcher>> = Arc::new(DashMap::new());

    let sessions_for_listener = sessions.clone();
    let listener = acceptor.add_connect_listener(Arc::new(move |port: Arc<dyn Port>| {
        if port.name() != port_name {
            return;
        }
        serve_port(port, &table, &options, &sessions_for_listener);
    }));

    PortService {
        acceptor,
        listener,
        sessions,
    }
}

fn serve_port(
    port: Arc<dyn Port>,
    table: &Arc<MethodTable>,
    options: &ServeOptions,
    sessions: &Arc<DashMap<String, Dispatcher>>,
) {
    let origin = port.sender_url().and_then(origin_of);
    let session_id = Uuid::new_v4().to_string();
    info!(
        "Serving port {} for {} ({})",
        port.name(),
        origin.as_deref().unwrap_or("unknown origin"),
        session_id
    );

    let transport: Arc<dyn Transport> = port.clone();
    let dispatcher = Dispatcher::with_caller_origin(
        transport,
        table.clone(),
        options.config.clone(),
        origin,
    );
    if options.auto_init {
        dispatcher.init(Vec::new());
    }
    let updates = dispatcher.updates();
    sessions.insert(session_id.clone(), dispatcher);

    let sessions = Arc::downgrade(sessions);
    let hook = options.on_disconnect.clone();
    let name = port.name().to_owned();
    port.on_disconnect(Box::new(move || {
        if let Some(sessions) = sessions.upgrade() {
            if let Some((_, dispatcher)) = sessions.remove(&session_id) {
                dispatcher.destroy();
            }
        }
        if let Some(hook) = hook {
            hook(updates);
        }
        info!("Port {} disconnected ({})", name, session_id);
    }));
}

/// Opens `port_name` through `opener`, serves `table` on it and reopens it
/// whenever it disconnects. Failed opens are retried after
/// `reconnect_delay`. Runs until the returned task is aborted.
pub fn serve_reverse_port(
    opener: Arc<dyn PortOpener>,
    port_name: impl Into<String>,
    table: Arc<MethodTable>,
    config: DispatcherConfig,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    let port_name = port_name.into();
    tokio::spawn(async move {
        loop {
            match opener.open(&port_name).await {
                Ok(port) => {
                    let (closed_tx, closed_rx) = oneshot::channel();
                    port.on_disconnect(Box::new(move || {
                        let _ = closed_tx.send(());
                    }));
                    let origin = port.sender_url().and_then(origin_of);
                    let transport: Arc<dyn Transport> = port.clone();
                    let dispatcher = Dispatcher::with_caller_origin(
                        transport,
                        table.clone(),
                        config.clone(),
                        origin,
                    );
                    info!("Serving reverse port: {}", port_name);

                    let _ = closed_rx.await;
                    dispatcher.destroy();
                    warn!("Reverse port {} disconnected, reopening", port_name);
                    continue;
                }
                Err(e) => error!("Failed to open reverse port {}: {}", port_name, e),
            }
            tokio::time::sleep(reconnect_delay).await;
        }
    })
}
