//! # WebSocket Relay Ports
//!
//! Opens relay ports on a `bridge-server` over WebSockets. Each port is one
//! WebSocket connection to `<base_url>/<port name>`; envelopes travel as
//! text frames. The connection is driven by three tasks:
//! - outbound: drains the send queue into the socket
//! - heartbeat: queues a ping every [`HEARTBEAT_INTERVAL_SECS`]
//! - inbound: hands text frames to the listeners, starting once the first
//!   listener is added so nothing the server pushes on connect is lost
//!
//! A close frame, a socket error or an explicit `disconnect` fires the
//! port's disconnect signal exactly once.

use async_trait::async_trait;
use bridge_protocol::{
    Carrier, DisconnectSignal, Frame, Inbound, Listener, ListenerId, Listeners, Port, PortOpener,
    Transport, TransportError,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Interval between heartbeat pings on an idle port.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Opens [`WsPort`]s against a relay server, e.g.
/// `WsPortOpener::new("ws://127.0.0.1:7070/port")`.
#[derive(Debug, Clone)]
pub struct WsPortOpener {
    base_url: String,
}

impl WsPortOpener {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn port_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), name)
    }
}

#[async_trait]
impl PortOpener for WsPortOpener {
    async fn open(&self, name: &str) -> Result<Arc<dyn Port>, TransportError> {
        let url = self.port_url(name);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Open {
                name: name.to_owned(),
                reason: e.to_string(),
            })?;
        info!("Connected to relay: {}", url);
        Ok(Arc::new(WsPort::start(name, ws_stream)))
    }
}

/// The client end of a relay port carried by one WebSocket.
pub struct WsPort {
    name: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    listeners: Arc<Listeners<Inbound>>,
    signal: Arc<DisconnectSignal>,
    listening: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsPort {
    fn start<S>(name: &str, ws_stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + 'static,
    {
        let (mut ws_sink, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let listeners = Arc::new(Listeners::new());
        let signal = Arc::new(DisconnectSignal::default());
        let listening = Arc::new(Notify::new());

        // ── Outbound Sender Task ──
        let out_signal = signal.clone();
        let outbound = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let msg = match out {
                    Outbound::Text(text) => Message::Text(text.into()),
                    Outbound::Ping => Message::Ping(Default::default()),
                    Outbound::Close => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if ws_sink.send(msg).await.is_err() {
                    break;
                }
            }
            out_signal.fire();
        });

        // ── Heartbeat Task ──
        let tx_ping = tx.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS))
                    .await;
                if tx_ping.send(Outbound::Ping).is_err() {
                    break;
                }
            }
        });

        // ── Inbound Message Loop ──
        let in_listeners = listeners.clone();
        let in_signal = signal.clone();
        let port_name = name.to_owned();
        let first_listener = listening.clone();
        let inbound = tokio::spawn(async move {
            first_listener.notified().await;
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => {
                        in_listeners.emit(Inbound::new(Frame::Text(text.to_string())));
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            if in_signal.fire() {
                warn!("Relay closed port: {}", port_name);
            }
        });

        Self {
            name: name.to_owned(),
            outbound: tx,
            listeners,
            signal,
            listening,
            tasks: vec![outbound, heartbeat, inbound],
        }
    }
}

impl Transport for WsPort {
    fn carrier(&self) -> Carrier {
        Carrier::Text
    }

    fn post(&self, frame: Frame, _target_origin: Option<&str>) -> Result<(), TransportError> {
        if self.signal.is_fired() {
            return Err(TransportError::Disconnected);
        }
        let text = frame.into_text()?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Disconnected)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.listeners.add(listener);
        self.listening.notify_one();
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

impl Port for WsPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn sender_url(&self) -> Option<&str> {
        None
    }

    fn on_disconnect(&self, callback: Box<dyn FnOnce() + Send>) {
        self.signal.subscribe(callback);
    }

    fn disconnect(&self) {
        let _ = self.outbound.send(Outbound::Close);
        if self.signal.fire() {
            debug!(port = %self.name, "port disconnected locally");
        }
    }

    fn is_connected(&self) -> bool {
        !self.signal.is_fired()
    }
}

impl Drop for WsPort {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
