//! # Client Connector
//!
//! The caller side of the bridge. A [`Connector`] owns the tracking tables
//! for its in-flight calls and is attached to one transport at a time:
//!
//! ```text
//! request() ──callMethod──▶ transport ──▶ dispatcher
//!    ▲                                        │
//!    └── PendingResponse ◀── methodResponse ──┘
//! ```
//!
//! Inbound frames are decoded, filtered by channel and routed to the pending
//! call, its streaming callback, the update handler or the unhandled-error
//! handler. The transport handle can be swapped at runtime without changing
//! the connector's identity, which is what the port adapter and the reverse
//! connector build on.

use crate::config::{ConnectorConfig, PendingPolicy};
use crate::error::{CallError, ConnectorError, RemoteError};
use crate::state::{CallTable, PendingCall, ProgressCallback};
use bridge_protocol::transport::post_envelope;
use bridge_protocol::{
    Envelope, Inbound, ListenerId, Message, MessageId, Transport, Update, Value,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub type UpdateHandler = Arc<dyn Fn(Update) + Send + Sync>;
pub type UnhandledErrorHandler = Arc<dyn Fn(RemoteError) + Send + Sync>;

/// Subscribers for messages that are not responses to a call.
#[derive(Clone, Default)]
pub struct Handlers {
    on_update: Option<UpdateHandler>,
    on_unhandled_error: Option<UnhandledErrorHandler>,
}

impl Handlers {
    /// Called for every `update` pushed by the callee on this channel.
    pub fn on_update(mut self, f: impl Fn(Update) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Replaces the default handler, which logs the remote error at error
    /// level.
    pub fn on_unhandled_error(mut self, f: impl Fn(RemoteError) + Send + Sync + 'static) -> Self {
        self.on_unhandled_error = Some(Arc::new(f));
        self
    }
}

/// A call to make: method name, arguments and an optional streaming
/// callback.
#[derive(Debug, Clone)]
pub struct Request {
    pub name: String,
    pub args: Vec<Value>,
    pub progress: Option<ProgressCallback>,
}

impl Request {
    /// A call to `name` with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            progress: None,
        }
    }

    /// Appends one positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    /// Streams `methodCallback` arguments to `progress` until the call
    /// settles or the callback is canceled.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Deferred result of [`Connector::request`].
///
/// The call is already on the wire when this is returned; dropping it does
/// not cancel anything, and the pending entry is still cleaned up when the
/// response arrives.
#[derive(Debug)]
pub struct PendingResponse {
    message_id: MessageId,
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl PendingResponse {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(CallError::Destroyed)))
    }
}

/// The transport currently attached, with the listener registered on it.
struct Link {
    transport: Arc<dyn Transport>,
    listener: ListenerId,
    target_origin: Option<String>,
}

struct Inner {
    config: ConnectorConfig,
    link: RwLock<Option<Link>>,
    calls: Mutex<CallTable>,
    on_update: Option<UpdateHandler>,
    on_unhandled_error: UnhandledErrorHandler,
}

/// Caller-side RPC endpoint. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Connector`], used by listeners and disconnect
/// callbacks so they do not keep it alive.
#[derive(Clone)]
pub struct WeakConnector {
    inner: Weak<Inner>,
}

impl WeakConnector {
    pub fn upgrade(&self) -> Option<Connector> {
        self.inner.upgrade().map(|inner| Connector { inner })
    }
}

impl Connector {
    /// Attaches a connector to `transport` with the default handlers.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectorConfig) -> Self {
        Self::with_handlers(transport, config, Handlers::default())
    }

    /// Attaches a connector to `transport`. Unhandled remote errors go to
    /// `handlers`, or to the log when no handler is set.
    pub fn with_handlers(
        transport: Arc<dyn Transport>,
        config: ConnectorConfig,
        handlers: Handlers,
    ) -> Self {
        let on_unhandled_error = handlers
            .on_unhandled_error
            .unwrap_or_else(|| Arc::new(log_unhandled_error));
        let connector = Self {
            inner: Arc::new(Inner {
                config,
                link: RwLock::new(None),
                calls: Mutex::new(CallTable::default()),
                on_update: handlers.on_update,
                on_unhandled_error,
            }),
        };
        connector.replace_transport(transport);
        connector
    }

    pub fn downgrade(&self) -> WeakConnector {
        WeakConnector {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Sends a one-way `init` message. Nothing is awaited.
    pub fn init(&self, args: Vec<Value>) -> Result<(), ConnectorError> {
        self.send(Message::Init { args }, Vec::new())
    }

    /// Sends a `callMethod` message and returns its deferred result.
    ///
    /// A synchronous send failure unregisters the call again and is returned
    /// as the error.
    pub fn request(&self, request: Request) -> Result<PendingResponse, ConnectorError> {
        let message_id = Uuid::new_v4().simple().to_string();
        let with_callback = request.progress.is_some();
        let (settle, rx) = oneshot::channel();

        self.inner.calls.lock().insert(
            message_id.clone(),
            PendingCall {
                settle,
                progress: request.progress,
            },
        );

        let message = Message::CallMethod {
            message_id: message_id.clone(),
            name: request.name,
            args: request.args,
            with_callback,
        };
        if let Err(err) = self.send(message, Vec::new()) {
            self.inner.calls.lock().take(&message_id);
            return Err(err);
        }

        Ok(PendingResponse { message_id, rx })
    }

    /// Stops streaming progress to `callback`.
    ///
    /// Sends one `cancelProgress` for the call the callback belongs to. A
    /// callback that is unknown, already settled or already canceled is a
    /// no-op. If the send fails the callback stays live, so the cancel can
    /// be retried.
    pub fn cancel_callback(&self, callback: &ProgressCallback) -> Result<(), ConnectorError> {
        let Some(message_id) = self.inner.calls.lock().cancel(callback.id()) else {
            return Ok(());
        };
        self.send(Message::CancelProgress { message_id }, Vec::new())
            .inspect_err(|_| self.inner.calls.lock().restore(callback.id()))
    }

    /// Routes one inbound frame. Never fails: frames that do not decode,
    /// belong to another channel or another origin are dropped.
    pub fn on_message(&self, inbound: Inbound) {
        if let Some(expected) = self.inner.config.expected_origin.as_deref() {
            if inbound.origin.as_deref() != Some(expected) {
                return;
            }
        }

        let envelope = match inbound.frame.into_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        if !envelope.is_for(self.inner.config.channel.as_deref()) {
            return;
        }

        match envelope.message {
            Message::Update { update } => {
                if let Some(on_update) = &self.inner.on_update {
                    on_update(update);
                }
            }

            Message::MethodResponse {
                message_id,
                response,
                error,
            } => {
                let call = self.inner.calls.lock().take(&message_id);
                let Some(call) = call else {
                    debug!(%message_id, "response for unknown call");
                    return;
                };
                let outcome = match error {
                    Some(error) => Err(CallError::Remote(error.into())),
                    None => Ok(response),
                };
                // The caller may have dropped the deferred; that is fine.
                let _ = call.settle.send(outcome);
            }

            Message::MethodCallback {
                message_id,
                callback_args,
            } => {
                let progress = self.inner.calls.lock().progress_for(&message_id);
                if let Some(progress) = progress {
                    progress.invoke(callback_args);
                }
            }

            Message::UnhandledError { error } => {
                let error = error.map(RemoteError::from).unwrap_or_else(|| RemoteError {
                    message: "unhandled error in remote context".to_owned(),
                    stack: None,
                });
                (self.inner.on_unhandled_error)(error);
            }

            other => debug!(kind = other.kind(), "ignoring callee-bound message"),
        }
    }

    /// Attaches the connector to `transport`, detaching it from the previous
    /// one. Pending calls are left alone.
    pub fn replace_transport(&self, transport: Arc<dyn Transport>) {
        let weak = self.downgrade();
        let listener = transport.add_listener(Arc::new(move |inbound| {
            if let Some(connector) = weak.upgrade() {
                connector.on_message(inbound);
            }
        }));
        let target_origin = transport
            .requires_target_origin()
            .then(|| self.inner.config.target_origin.clone());

        let previous = self.inner.link.write().replace(Link {
            transport,
            listener,
            target_origin,
        });
        if let Some(previous) = previous {
            previous.transport.remove_listener(previous.listener);
        }
    }

    /// Applies the configured [`PendingPolicy`] after the transport was lost.
    pub fn handle_transport_loss(&self) {
        if self.inner.config.pending_policy == PendingPolicy::RejectOnDisconnect {
            self.reject_pending();
        }
    }

    /// Rejects every pending call with [`CallError::Disconnected`].
    pub fn reject_pending(&self) {
        let calls = self.inner.calls.lock().drain();
        if !calls.is_empty() {
            warn!(count = calls.len(), "rejecting calls pending on a lost transport");
        }
        for call in calls {
            let _ = call.settle.send(Err(CallError::Disconnected));
        }
    }

    /// Number of calls still waiting for their `methodResponse`.
    pub fn pending_count(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Detaches from the transport and clears the tracking tables.
    /// Outstanding deferreds resolve to [`CallError::Destroyed`].
    pub fn destroy(&self) {
        if let Some(link) = self.inner.link.write().take() {
            link.transport.remove_listener(link.listener);
        }
        drop(self.inner.calls.lock().drain());
    }

    fn send(&self, message: Message, transfer: Vec<Bytes>) -> Result<(), ConnectorError> {
        let (transport, target_origin) = {
            let link = self.inner.link.read();
            let link = link.as_ref().ok_or(ConnectorError::Destroyed)?;
            (link.transport.clone(), link.target_origin.clone())
        };
        let kind = message.kind();
        let envelope = Envelope::new(self.inner.config.channel.clone(), message);
        post_envelope(transport.as_ref(), envelope, transfer, target_origin.as_deref())
            .inspect_err(|e| error!(kind, error = %e, "failed to send"))?;
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.transport.remove_listener(link.listener);
        }
    }
}

fn log_unhandled_error(err: RemoteError) {
    error!(
        message = %err.message,
        stack = err.stack.as_deref().unwrap_or_default(),
        "unhandled error in remote context"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::memory::{MemoryChannel, MemoryPort};
    use bridge_protocol::{Carrier, Detached, ErrorPayload, Frame, TransportError};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// The far end of a channel or port, driven by hand.
    struct FakeCallee {
        endpoint: Arc<dyn Transport>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    }

    impl FakeCallee {
        fn attach(endpoint: Arc<dyn Transport>) -> Self {
            let (tx, inbox) = mpsc::unbounded_channel();
            endpoint.add_listener(Arc::new(move |inbound: Inbound| {
                if let Ok(envelope) = inbound.frame.into_envelope() {
                    let _ = tx.send(envelope);
                }
            }));
            Self { endpoint, inbox }
        }

        async fn next(&mut self) -> Envelope {
            timeout(Duration::from_secs(1), self.inbox.recv())
                .await
                .expect("callee waited too long")
                .expect("channel closed")
        }

        async fn nothing_more(&mut self) {
            assert!(timeout(Duration::from_millis(50), self.inbox.recv()).await.is_err());
        }

        fn reply(&self, channel: Option<&str>, message: Message) {
            let frame = Frame::Structured {
                envelope: Envelope::new(channel.map(str::to_owned), message),
                transfer: vec![],
            };
            self.endpoint.post(frame, None).unwrap();
        }

        fn respond(&self, message_id: &str, response: Value) {
            self.reply(
                None,
                Message::MethodResponse {
                    message_id: message_id.to_owned(),
                    response,
                    error: None,
                },
            );
        }
    }

    fn setup(config: ConnectorConfig, handlers: Handlers) -> (Connector, FakeCallee) {
        let (near, far) = MemoryChannel::worker();
        let connector = Connector::with_handlers(near, config, handlers);
        (connector, FakeCallee::attach(far))
    }

    fn call_id(envelope: &Envelope) -> String {
        envelope.message.message_id().expect("not a call").to_owned()
    }

    #[tokio::test]
    async fn simple_call_resolves_with_response() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());

        let pending = connector
            .request(Request::new("getBalance").arg("acc1"))
            .unwrap();
        let sent = callee.next().await;
        assert_eq!(
            sent.message,
            Message::CallMethod {
                message_id: pending.message_id().to_owned(),
                name: "getBalance".into(),
                args: vec![Value::from("acc1")],
                with_callback: false,
            }
        );

        callee.respond(&call_id(&sent), Value::from("42"));
        assert_eq!(pending.await.unwrap(), Value::from("42"));
        assert_eq!(connector.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_rejects_with_remote_message() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        let pending = connector.request(Request::new("sign")).unwrap();
        let id = call_id(&callee.next().await);

        callee.reply(
            None,
            Message::MethodResponse {
                message_id: id,
                response: Value::Undefined,
                error: Some(ErrorPayload::new("Wrong password")),
            },
        );

        match pending.await {
            Err(CallError::Remote(err)) => assert_eq!(err.message, "Wrong password"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_responses_settle_only_once() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        let pending = connector.request(Request::new("getBalance")).unwrap();
        let id = call_id(&callee.next().await);

        callee.respond(&id, Value::from(1));
        callee.respond(&id, Value::from(2));

        assert_eq!(pending.await.unwrap(), Value::from(1));
        // Give the duplicate time to arrive; it must be ignored.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_settle_independently() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        let first = connector.request(Request::new("a")).unwrap();
        let second = connector.request(Request::new("b")).unwrap();
        let first_id = call_id(&callee.next().await);
        let second_id = call_id(&callee.next().await);
        assert_ne!(first_id, second_id);

        callee.respond(&second_id, Value::from("second"));
        assert_eq!(second.await.unwrap(), Value::from("second"));
        assert_eq!(connector.pending_count(), 1);

        callee.respond(&first_id, Value::from("first"));
        assert_eq!(first.await.unwrap(), Value::from("first"));
    }

    #[tokio::test]
    async fn cancel_callback_sends_one_cancel_progress() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let callback = ProgressCallback::new(move |args| {
            let _ = progress_tx.send(args);
        });

        let pending = connector
            .request(Request::new("scan").with_progress(callback.clone()))
            .unwrap();
        let sent = callee.next().await;
        let id = call_id(&sent);
        assert!(matches!(
            sent.message,
            Message::CallMethod { with_callback: true, ref args, .. } if args.is_empty()
        ));

        for n in [1, 2] {
            callee.reply(
                None,
                Message::MethodCallback {
                    message_id: id.clone(),
                    callback_args: vec![Value::from(n)],
                },
            );
        }
        assert_eq!(progress_rx.recv().await.unwrap(), vec![Value::from(1)]);
        assert_eq!(progress_rx.recv().await.unwrap(), vec![Value::from(2)]);

        connector.cancel_callback(&callback).unwrap();
        connector.cancel_callback(&callback).unwrap();
        assert_eq!(
            callee.next().await.message,
            Message::CancelProgress {
                message_id: id.clone()
            }
        );
        callee.nothing_more().await;

        // Late progress after cancellation is swallowed.
        callee.reply(
            None,
            Message::MethodCallback {
                message_id: id.clone(),
                callback_args: vec![Value::from(3)],
            },
        );
        callee.respond(&id, Value::from("stopped"));
        assert_eq!(pending.await.unwrap(), Value::from("stopped"));
        assert!(progress_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_cancel_can_be_retried() {
        let (near, far) = MemoryChannel::worker();
        let config = ConnectorConfig::default().with_pending_policy(PendingPolicy::Keep);
        let connector = Connector::new(near.clone(), config);
        let mut callee = FakeCallee::attach(far);
        let callback = ProgressCallback::new(|_| {});

        let _pending = connector
            .request(Request::new("scan").with_progress(callback.clone()))
            .unwrap();
        let id = call_id(&callee.next().await);

        connector.replace_transport(Arc::new(Detached::new(Carrier::Structured)));
        assert!(matches!(
            connector.cancel_callback(&callback),
            Err(ConnectorError::Transport(TransportError::NotConnected))
        ));

        connector.replace_transport(near);
        connector.cancel_callback(&callback).unwrap();
        assert_eq!(
            callee.next().await.message,
            Message::CancelProgress { message_id: id }
        );
    }

    #[tokio::test]
    async fn malformed_text_frame_is_dropped() {
        let (near, far) = MemoryPort::pair("bridge", None);
        let connector = Connector::new(near, ConnectorConfig::default());
        let mut callee = FakeCallee::attach(far.clone());

        let pending = connector.request(Request::new("getBalance")).unwrap();
        let id = call_id(&callee.next().await);

        far.post(Frame::Text("{not json".into()), None).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.pending_count(), 1);

        callee.respond(&id, Value::from("42"));
        assert_eq!(pending.await.unwrap(), Value::from("42"));
    }

    #[tokio::test]
    async fn cancel_of_unknown_callback_is_a_no_op() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        connector
            .cancel_callback(&ProgressCallback::new(|_| {}))
            .unwrap();
        callee.nothing_more().await;
    }

    #[tokio::test]
    async fn other_channels_are_ignored() {
        let (updates_tx, mut updates) = mpsc::unbounded_channel();
        let handlers = Handlers::default().on_update(move |update| {
            let _ = updates_tx.send(update);
        });
        let (connector, mut callee) =
            setup(ConnectorConfig::default().with_channel("wallet"), handlers);

        let pending = connector.request(Request::new("getBalance")).unwrap();
        let sent = callee.next().await;
        assert_eq!(sent.channel.as_deref(), Some("wallet"));
        let id = call_id(&sent);

        for channel in [None, Some("dapp")] {
            callee.reply(
                channel,
                Message::MethodResponse {
                    message_id: id.clone(),
                    response: Value::from("wrong"),
                    error: None,
                },
            );
            callee.reply(
                channel,
                Message::Update {
                    update: Update::new("updateBalances"),
                },
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.pending_count(), 1);
        assert!(updates.try_recv().is_err());

        callee.reply(
            Some("wallet"),
            Message::Update {
                update: Update::new("updateBalances"),
            },
        );
        assert_eq!(updates.recv().await.unwrap().kind, "updateBalances");
        drop(pending);
    }

    #[tokio::test]
    async fn unhandled_error_reaches_handler_without_touching_calls() {
        let (errors_tx, mut errors) = mpsc::unbounded_channel();
        let handlers = Handlers::default().on_unhandled_error(move |err| {
            let _ = errors_tx.send(err);
        });
        let (connector, mut callee) = setup(ConnectorConfig::default(), handlers);
        let _pending = connector.request(Request::new("slow")).unwrap();
        callee.next().await;

        callee.reply(
            None,
            Message::UnhandledError {
                error: Some(ErrorPayload::new("boom").with_stack("at worker:1")),
            },
        );

        let err = errors.recv().await.unwrap();
        assert_eq!(err.message, "boom");
        assert_eq!(err.stack.as_deref(), Some("at worker:1"));
        assert_eq!(connector.pending_count(), 1);
        assert!(timeout(Duration::from_millis(50), errors.recv()).await.is_err());
    }

    #[tokio::test]
    async fn reject_pending_fails_outstanding_calls() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        let pending = connector.request(Request::new("slow")).unwrap();
        callee.next().await;

        connector.handle_transport_loss();
        assert!(matches!(pending.await, Err(CallError::Disconnected)));
    }

    #[tokio::test]
    async fn keep_policy_leaves_calls_pending() {
        let config = ConnectorConfig::default().with_pending_policy(PendingPolicy::Keep);
        let (connector, mut callee) = setup(config, Handlers::default());
        let pending = connector.request(Request::new("slow")).unwrap();
        let id = call_id(&callee.next().await);

        connector.handle_transport_loss();
        callee.respond(&id, Value::Null);
        assert_eq!(pending.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn destroy_detaches_and_fails_outstanding_calls() {
        let (connector, mut callee) = setup(ConnectorConfig::default(), Handlers::default());
        let pending = connector.request(Request::new("slow")).unwrap();
        callee.next().await;

        connector.destroy();
        assert!(matches!(pending.await, Err(CallError::Destroyed)));
        assert!(matches!(
            connector.request(Request::new("again")),
            Err(ConnectorError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn window_transport_needs_expected_origin() {
        let (page, frame) = MemoryChannel::window("https://app.example", "https://dapp.example");
        let config = ConnectorConfig::default()
            .with_target_origin("https://app.example")
            .with_expected_origin("https://app.example");
        let connector = Connector::new(frame, config);
        let mut page_side = FakeCallee::attach(page);

        let pending = connector.request(Request::new("getAddress")).unwrap();
        let id = call_id(&page_side.next().await);
        page_side.respond(&id, Value::from("EQ..."));
        assert_eq!(pending.await.unwrap(), Value::from("EQ..."));
    }
}
