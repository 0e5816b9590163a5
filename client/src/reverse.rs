//! # Reverse Connector
//!
//! For the caller that cannot open a connection itself: it waits for the
//! other side to open a relay port with the configured name. Until then,
//! and again after that port disconnects, the connector sits on a stub
//! transport whose sends fail with "not yet connected".

use crate::config::ConnectorConfig;
use crate::connector::{Connector, Handlers};
use bridge_protocol::{Carrier, Detached, ListenerId, Port, PortAcceptor, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Slot = Arc<Mutex<Option<Arc<dyn Port>>>>;

pub struct ReverseConnector {
    connector: Connector,
    current: Slot,
    acceptor: Arc<dyn PortAcceptor>,
    listener: ListenerId,
}

impl ReverseConnector {
    /// Starts detached and attaches to every port named `port_name` that
    /// `acceptor` accepts. The newest such port wins.
    pub fn new(
        acceptor: Arc<dyn PortAcceptor>,
        port_name: impl Into<String>,
        config: ConnectorConfig,
        handlers: Handlers,
    ) -> Self {
        let port_name = port_name.into();
        let connector = Connector::with_handlers(
            Arc::new(Detached::new(Carrier::Text)),
            config,
            handlers,
        );
        let current: Slot = Arc::default();

        let weak = connector.downgrade();
        let slot = current.clone();
        let listener = acceptor.add_connect_listener(Arc::new(move |port: Arc<dyn Port>| {
            if port.name() != port_name {
                debug!(port = port.name(), "ignoring port with another name");
                return;
            }
            if let Some(connector) = weak.upgrade() {
                attach(&connector, &slot, port);
            }
        }));

        Self {
            connector,
            current,
            acceptor,
            listener,
        }
    }

    /// The connector to make calls on. Sends fail while detached.
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// `true` while a live port is attached.
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|port| port.is_connected())
    }
}

/// Swaps the connector onto `port` and arranges the swap back when that
/// port disconnects.
fn attach(connector: &Connector, slot: &Slot, port: Arc<dyn Port>) {
    info!("Port attached: {}", port.name());
    let transport: Arc<dyn Transport> = port.clone();
    connector.replace_transport(transport);
    *slot.lock() = Some(port.clone());

    let weak_connector = connector.downgrade();
    let weak_port = Arc::downgrade(&port);
    let slot = slot.clone();
    let name = port.name().to_owned();
    port.on_disconnect(Box::new(move || {
        let was_current = {
            let mut current = slot.lock();
            let is_this = current
                .as_ref()
                .is_some_and(|c| Arc::downgrade(c).ptr_eq(&weak_port));
            if is_this {
                current.take();
            }
            is_this
        };
        // A newer port may already have replaced this one.
        if !was_current {
            return;
        }
        let Some(connector) = weak_connector.upgrade() else {
            return;
        };
        warn!("Port detached: {}", name);
        connector.replace_transport(Arc::new(Detached::new(Carrier::Text)));
        connector.handle_transport_loss();
    }));
}

impl Drop for ReverseConnector {
    fn drop(&mut self) {
        self.acceptor.remove_connect_listener(self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Request;
    use crate::error::{CallError, ConnectorError};
    use bridge_protocol::memory::MemoryPortHub;
    use bridge_protocol::{Envelope, Frame, Inbound, Message, TransportError, Value};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn sends_fail_until_a_port_attaches_and_after_it_leaves() {
        let hub = Arc::new(MemoryPortHub::new());
        let reverse = ReverseConnector::new(
            hub.clone(),
            "bridge",
            ConnectorConfig::default(),
            Handlers::default(),
        );

        let err = reverse
            .connector()
            .request(Request::new("getBalance"))
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Transport(TransportError::NotConnected)
        ));

        // The active side opens the port and plays callee.
        let callee = hub.connect("bridge");
        let (tx, mut inbox) = mpsc::unbounded_channel();
        callee.add_listener(Arc::new(move |inbound: Inbound| {
            let _ = tx.send(inbound.frame.into_envelope().unwrap());
        }));
        assert!(reverse.is_connected());

        let pending = reverse
            .connector()
            .request(Request::new("getBalance").arg("acc1"))
            .unwrap();
        let sent = timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let message_id = sent.message.message_id().unwrap().to_owned();
        let reply = Envelope::new(
            None,
            Message::MethodResponse {
                message_id,
                response: Value::from("42"),
                error: None,
            },
        );
        callee
            .post(
                Frame::Structured {
                    envelope: reply,
                    transfer: vec![],
                },
                None,
            )
            .unwrap();
        assert_eq!(pending.await.unwrap(), Value::from("42"));

        let in_flight = reverse.connector().request(Request::new("slow")).unwrap();
        callee.disconnect();
        assert!(!reverse.is_connected());
        assert!(matches!(in_flight.await, Err(CallError::Disconnected)));
        assert!(matches!(
            reverse.connector().request(Request::new("again")),
            Err(ConnectorError::Transport(TransportError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn ports_with_other_names_are_ignored() {
        let hub = Arc::new(MemoryPortHub::new());
        let reverse = ReverseConnector::new(
            hub.clone(),
            "bridge",
            ConnectorConfig::default(),
            Handlers::default(),
        );

        let _other = hub.connect("devtools");
        assert!(!reverse.is_connected());
    }

    #[tokio::test]
    async fn stale_port_disconnect_keeps_the_newer_port() {
        let hub = Arc::new(MemoryPortHub::new());
        let reverse = ReverseConnector::new(
            hub.clone(),
            "bridge",
            ConnectorConfig::default(),
            Handlers::default(),
        );

        let first = hub.connect("bridge");
        let _second = hub.connect("bridge");
        first.disconnect();

        assert!(reverse.is_connected());
        assert!(reverse.connector().request(Request::new("ping")).is_ok());
    }
}
