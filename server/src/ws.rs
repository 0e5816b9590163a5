//! # WebSocket Port Handler
//!
//! `GET /port/{name}` upgrades to a WebSocket and exposes it as a relay
//! [`Port`] named `{name}`. The request's `Origin` header becomes the
//! port's sender URL. Every new port is announced through [`WsPortHub`],
//! which is the [`PortAcceptor`] the method tables are served from.

use crate::state::{AppState, PortInfo};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
};
use bridge_protocol::{
    Carrier, ConnectListener, DisconnectSignal, Frame, Inbound, Listener, ListenerId, Listeners,
    Port, PortAcceptor, Transport, TransportError,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Announces WebSocket ports to connect listeners.
#[derive(Default)]
pub struct WsPortHub {
    connect_listeners: Listeners<Arc<dyn Port>>,
}

impl WsPortHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn announce(&self, port: Arc<dyn Port>) {
        self.connect_listeners.emit(port);
    }
}

impl PortAcceptor for WsPortHub {
    fn add_connect_listener(&self, listener: ConnectListener) -> ListenerId {
        self.connect_listeners.add(listener)
    }

    fn remove_connect_listener(&self, id: ListenerId) {
        self.connect_listeners.remove(id);
    }
}

/// `None` asks the outbound task to close the socket.
type OutboundTx = mpsc::UnboundedSender<Option<String>>;

/// Server end of a relay port carried by one WebSocket.
struct ServerPort {
    name: String,
    sender_url: Option<String>,
    outbound: OutboundTx,
    listeners: Listeners<Inbound>,
    signal: DisconnectSignal,
}

impl Transport for ServerPort {
    fn carrier(&self) -> Carrier {
        Carrier::Text
    }

    fn post(&self, frame: Frame, _target_origin: Option<&str>) -> Result<(), TransportError> {
        if self.signal.is_fired() {
            return Err(TransportError::Disconnected);
        }
        let text = frame.into_text()?;
        self.outbound
            .send(Some(text))
            .map_err(|_| TransportError::Disconnected)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

impl Port for ServerPort {
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
        let _ = self.outbound.send(None);
        self.signal.fire();
    }

    fn is_connected(&self) -> bool {
        !self.signal.is_fired()
    }
}

/// `GET /port/{name}`
pub async fn port_handler(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    ws.on_upgrade(move |socket| handle_port(socket, name, origin, state))
}

async fn handle_port(socket: WebSocket, name: String, origin: Option<String>, state: AppState) {
    let port_id = Uuid::new_v4().to_string();
    info!("New port: {} ({})", name, port_id);

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();

    let port = Arc::new(ServerPort {
        name: name.clone(),
        sender_url: origin.clone(),
        outbound: tx,
        listeners: Listeners::new(),
        signal: DisconnectSignal::default(),
    });
    state.ports.insert(
        port_id.clone(),
        PortInfo {
            id: port_id.clone(),
            name,
            origin,
        },
    );

    // Outbound task
    let outbound_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let Some(text) = out else {
                let _ = ws_sink.send(Message::Close(None)).await;
                break;
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    state.hub.announce(port.clone());

    // Inbound
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                port.listeners
                    .emit(Inbound::new(Frame::Text(text.to_string())));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cleanup
    info!("Port closed: {}", port_id);
    outbound_task.abort();
    if port.signal.fire() {
        debug!(port = %port.name, "disconnect fired by socket close");
    }
    state.ports.remove(&port_id);
}
