//! # Callee Dispatcher
//!
//! Receives `init`, `callMethod` and `cancelProgress` from one transport and
//! runs them against a [`MethodTable`]:
//!
//! ```text
//! callMethod ──▶ spawn(handler) ──ok──▶ methodResponse{response}
//!                     │        └─err──▶ methodResponse{error}
//!                     └─ progress ────▶ methodCallback (until canceled)
//! ```
//!
//! Each call runs in its own task. A panicking handler is answered with an
//! error response. Failures of `init` and of guarded background tasks have
//! no call to blame and are reported as `unhandledError`. With
//! [`DispatcherConfig::report_panics`], panics anywhere else in the process
//! are reported the same way.

use crate::outbox::{Outbox, Progress, UpdateSender};
use crate::table::{CallContext, InitContext, MethodError, MethodTable};
use bridge_protocol::memory::ANY_ORIGIN;
use bridge_protocol::{ErrorPayload, Inbound, ListenerId, Message, MessageId, Transport, Value};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use tracing::{debug, warn};

tokio::task_local! {
    /// Set while a task runs that catches and answers its own panics.
    static CATCHES_PANICS: ();
}

/// Dispatchers that receive panics from the process-wide hook.
static PANIC_REPORTERS: Mutex<Vec<Weak<Inner>>> = parking_lot::const_mutex(Vec::new());
static PANIC_HOOK: Once = Once::new();

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Logical channel; only envelopes with the same tag are processed.
    pub channel: Option<String>,
    /// Recipient origin for window-like transports.
    pub target_origin: String,
    /// When set, inbound frames from any other origin are ignored.
    pub expected_origin: Option<String>,
    /// Send `unhandledError` for context-wide failures. Off means they are
    /// only logged.
    pub report_unhandled: bool,
    /// Also report panics of tasks the dispatcher did not spawn.
    pub report_panics: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel: None,
            target_origin: ANY_ORIGIN.to_owned(),
            expected_origin: None,
            report_unhandled: true,
            report_panics: false,
        }
    }
}

impl DispatcherConfig {
    /// Only handle envelopes tagged with `channel`, and tag replies with it.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = origin.into();
        self
    }

    pub fn with_expected_origin(mut self, origin: impl Into<String>) -> Self {
        self.expected_origin = Some(origin.into());
        self
    }

    /// Failures with no call to blame are only logged.
    pub fn ignore_unhandled(mut self) -> Self {
        self.report_unhandled = false;
        self
    }

    /// Forward every panic in the process to the caller as `unhandledError`,
    /// except those of call tasks and guarded tasks.
    pub fn report_panics(mut self) -> Self {
        self.report_panics = true;
        self
    }
}

struct Inner {
    config: DispatcherConfig,
    table: Arc<MethodTable>,
    transport: Arc<dyn Transport>,
    outbox: Outbox,
    /// Origin of the caller, passed to handlers when the frame has none.
    caller_origin: Option<String>,
    listener: Mutex<Option<ListenerId>>,
    /// Cancel flags of running calls made with a callback.
    callbacks: Mutex<HashMap<MessageId, Arc<AtomicBool>>>,
}

/// Callee-side endpoint bound to one transport. Cheap to clone.
///
/// Must be created and driven inside a tokio runtime.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Binds a dispatcher to `transport` and starts listening on it.
    pub fn new(
        transport: Arc<dyn Transport>,
        table: Arc<MethodTable>,
        config: DispatcherConfig,
    ) -> Self {
        Self::with_caller_origin(transport, table, config, None)
    }

    /// Like [`Dispatcher::new`], with the caller's origin known up front
    /// (relay ports resolve it from the port's sender URL).
    pub fn with_caller_origin(
        transport: Arc<dyn Transport>,
        table: Arc<MethodTable>,
        config: DispatcherConfig,
        caller_origin: Option<String>,
    ) -> Self {
        let outbox = Outbox::new(
            transport.clone(),
            config.channel.clone(),
            &config.target_origin,
        );
        let inner = Arc::new(Inner {
            config,
            table,
            transport: transport.clone(),
            outbox,
            caller_origin,
            listener: Mutex::new(None),
            callbacks: Mutex::new(HashMap::new()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let listener = transport.add_listener(Arc::new(move |inbound| {
            if let Some(inner) = weak.upgrade() {
                Dispatcher { inner }.on_message(inbound);
            }
        }));
        *inner.listener.lock() = Some(listener);

        if inner.config.report_panics {
            install_panic_hook();
            PANIC_REPORTERS.lock().push(Arc::downgrade(&inner));
        }

        Self { inner }
    }

    /// Handles one inbound frame. Undecodable frames, frames for another
    /// channel and, with an expected origin, frames from another origin are
    /// dropped.
    pub fn on_message(&self, inbound: Inbound) {
        let config = &self.inner.config;
        if let Some(expected) = config.expected_origin.as_deref() {
            if inbound.origin.as_deref() != Some(expected) {
                debug!(origin = ?inbound.origin, "dropping frame from unexpected origin");
                return;
            }
        }
        // Window-like transports know the origin per frame.
        let origin = inbound
            .origin
            .clone()
            .or_else(|| self.inner.caller_origin.clone());

        let envelope = match inbound.frame.into_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };
        if !envelope.is_for(config.channel.as_deref()) {
            return;
        }

        match envelope.message {
            Message::Init { args } => self.run_init(origin, args),

            Message::CallMethod {
                message_id,
                name,
                args,
                with_callback,
            } => self.run_call(origin, message_id, name, args, with_callback),

            Message::CancelProgress { message_id } => {
                if let Some(flag) = self.inner.callbacks.lock().get(&message_id) {
                    debug!(%message_id, "progress canceled");
                    flag.store(true, Ordering::SeqCst);
                }
            }

            other => debug!(kind = other.kind(), "ignoring caller-bound message"),
        }
    }

    /// Runs the table's `init` entry as if an `init` message had arrived.
    pub fn init(&self, args: Vec<Value>) {
        self.run_init(self.inner.caller_origin.clone(), args);
    }

    fn run_init(&self, origin: Option<String>, args: Vec<Value>) {
        let ctx = InitContext {
            origin,
            updates: self.updates(),
        };
        let table = self.inner.table.clone();
        self.spawn_guarded(async move { table.init(ctx, args).await });
    }

    fn run_call(
        &self,
        origin: Option<String>,
        message_id: MessageId,
        name: String,
        args: Vec<Value>,
        with_callback: bool,
    ) {
        let progress = with_callback.then(|| {
            let canceled = Arc::new(AtomicBool::new(false));
            self.inner
                .callbacks
                .lock()
                .insert(message_id.clone(), canceled.clone());
            Progress::new(message_id.clone(), canceled, self.inner.outbox.clone())
        });
        let ctx = CallContext {
            name: name.clone(),
            origin,
            progress,
        };

        let inner = self.inner.clone();
        tokio::spawn(CATCHES_PANICS.scope((), async move {
            let table = inner.table.clone();
            let call = async { table.call(&name, ctx, args).await };
            let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(MethodError::Panicked {
                    method: name.clone(),
                    reason: panic_message(panic.as_ref()),
                }),
            };
            inner.callbacks.lock().remove(&message_id);

            let (message, transfer) = match outcome {
                Ok(response) => {
                    let transfer = response.transferable().into_iter().collect();
                    let message = Message::MethodResponse {
                        message_id,
                        response,
                        error: None,
                    };
                    (message, transfer)
                }
                Err(e) => {
                    debug!(method = %name, error = %e, "method failed");
                    let message = Message::MethodResponse {
                        message_id,
                        response: Value::Undefined,
                        error: Some(ErrorPayload::new(e.to_string())),
                    };
                    (message, Vec::new())
                }
            };
            if let Err(e) = inner.outbox.send(message, transfer) {
                warn!("Failed to answer {}: {}", name, e);
            }
        }));
    }

    /// Spawns a background task whose failure, error or panic, is reported
    /// as `unhandledError`.
    pub fn spawn_guarded<F, E>(&self, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(CATCHES_PANICS.scope((), async move {
            let message = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            dispatcher.report_unhandled(message, None);
        }));
    }

    /// Reports a failure no call can be blamed for, unless reporting is
    /// disabled.
    pub fn report_unhandled(&self, message: impl Into<String>, stack: Option<String>) {
        let message = message.into();
        if !self.inner.config.report_unhandled {
            warn!(%message, "unhandled error (not reported)");
            return;
        }
        self.inner.outbox.report_unhandled(message, stack);
    }

    /// Sender for `update` pushes to this dispatcher's caller.
    pub fn updates(&self) -> UpdateSender {
        UpdateSender::new(self.inner.outbox.clone())
    }

    /// Number of running calls made with a callback.
    pub fn running_callbacks(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    /// Stops listening and stops receiving process-wide panics. Calls
    /// already running still send their response.
    pub fn destroy(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            self.inner.transport.remove_listener(listener);
        }
        self.inner.callbacks.lock().clear();
        let this = Arc::as_ptr(&self.inner);
        PANIC_REPORTERS
            .lock()
            .retain(|reporter| !std::ptr::eq(reporter.as_ptr(), this));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            self.transport.remove_listener(listener);
        }
    }
}

/// Chains a hook in front of the current panic hook, once per process.
/// Panics inside call tasks and guarded tasks are left to those tasks.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            previous(info);
            if CATCHES_PANICS.try_with(|_| ()).is_ok() {
                return;
            }
            let reporters: Vec<Arc<Inner>> = {
                let mut reporters = PANIC_REPORTERS.lock();
                reporters.retain(|reporter| reporter.strong_count() > 0);
                reporters.iter().filter_map(Weak::upgrade).collect()
            };
            if reporters.is_empty() {
                return;
            }
            let message = format!("panicked: {}", panic_message(info.payload()));
            let stack = info.location().map(|location| format!("at {location}"));
            for inner in reporters {
                Dispatcher { inner }.report_unhandled(message.clone(), stack.clone());
            }
        }));
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::memory::{MemoryChannel, MemoryPort};
    use bridge_protocol::{Envelope, Frame, Update};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// The caller end of a channel or port, driven by hand.
    struct FakeCaller {
        endpoint: Arc<dyn Transport>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    }

    impl FakeCaller {
        fn attach(endpoint: Arc<dyn Transport>) -> Self {
            let (tx, inbox) = mpsc::unbounded_channel();
            endpoint.add_listener(Arc::new(move |inbound: Inbound| {
                if let Ok(envelope) = inbound.frame.into_envelope() {
                    let _ = tx.send(envelope);
                }
            }));
            Self { endpoint, inbox }
        }

        fn send(&self, channel: Option<&str>, message: Message) {
            let frame = Frame::Structured {
                envelope: Envelope::new(channel.map(str::to_owned), message),
                transfer: vec![],
            };
            self.endpoint.post(frame, None).unwrap();
        }

        fn call(&self, id: &str, name: &str, args: Vec<Value>, with_callback: bool) {
            self.send(
                None,
                Message::CallMethod {
                    message_id: id.to_owned(),
                    name: name.to_owned(),
                    args,
                    with_callback,
                },
            );
        }

        async fn next(&mut self) -> Message {
            timeout(Duration::from_secs(1), self.inbox.recv())
                .await
                .expect("caller waited too long")
                .expect("channel closed")
                .message
        }

        async fn nothing_more(&mut self) {
            assert!(timeout(Duration::from_millis(50), self.inbox.recv())
                .await
                .is_err());
        }
    }

    fn setup(table: MethodTable, config: DispatcherConfig) -> (Dispatcher, FakeCaller) {
        let (near, far) = MemoryChannel::worker();
        let dispatcher = Dispatcher::new(near, Arc::new(table), config);
        (dispatcher, FakeCaller::attach(far))
    }

    #[tokio::test]
    async fn call_is_answered_with_the_handler_result() {
        let table = MethodTable::new().method("getBalance", |_, args| async move {
            match args.first().and_then(Value::as_str) {
                Some("acc1") => Ok(Value::from("42")),
                _ => Err(MethodError::failed("unknown account")),
            }
        });
        let (_dispatcher, mut caller) = setup(table, DispatcherConfig::default());

        caller.call("m1", "getBalance", vec![Value::from("acc1")], false);
        assert_eq!(
            caller.next().await,
            Message::MethodResponse {
                message_id: "m1".into(),
                response: Value::from("42"),
                error: None,
            }
        );

        caller.call("m2", "getBalance", vec![Value::from("acc2")], false);
        assert_eq!(
            caller.next().await,
            Message::MethodResponse {
                message_id: "m2".into(),
                response: Value::Undefined,
                error: Some(ErrorPayload::new("unknown account")),
            }
        );
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (_dispatcher, mut caller) = setup(MethodTable::new(), DispatcherConfig::default());
        caller.call("m1", "nope", vec![], false);

        match caller.next().await {
            Message::MethodResponse { error: Some(e), .. } => {
                assert_eq!(e.message, "method not found: nope")
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_gets_an_error_response() {
        let table = MethodTable::new().method("explode", |_, _| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let (_dispatcher, mut caller) = setup(table, DispatcherConfig::default());
        caller.call("m1", "explode", vec![], false);

        match caller.next().await {
            Message::MethodResponse {
                message_id,
                error: Some(e),
                ..
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(e.message, "method `explode` panicked: kaboom");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_progress_flips_the_flag_the_handler_polls() {
        let table = MethodTable::new().method("count", |ctx, _| async move {
            let Some(progress) = ctx.progress().cloned() else {
                return Err(MethodError::failed("needs a callback"));
            };
            let mut n = 0;
            while !progress.is_canceled() {
                n += 1;
                progress.send(vec![Value::from(n)]).map_err(MethodError::failed)?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(Value::from("stopped"))
        });
        let (dispatcher, mut caller) = setup(table, DispatcherConfig::default());

        caller.call("m1", "count", vec![], true);
        assert_eq!(
            caller.next().await,
            Message::MethodCallback {
                message_id: "m1".into(),
                callback_args: vec![Value::from(1)],
            }
        );
        assert_eq!(dispatcher.running_callbacks(), 1);

        caller.send(
            None,
            Message::CancelProgress {
                message_id: "m1".into(),
            },
        );
        loop {
            match caller.next().await {
                Message::MethodCallback { .. } => continue,
                response => {
                    assert_eq!(
                        response,
                        Message::MethodResponse {
                            message_id: "m1".into(),
                            response: Value::from("stopped"),
                            error: None,
                        }
                    );
                    break;
                }
            }
        }
        assert_eq!(dispatcher.running_callbacks(), 0);
    }

    #[tokio::test]
    async fn init_failure_is_reported_once_as_unhandled() {
        let table = MethodTable::new()
            .on_init(|_, _| async { Err(MethodError::failed("storage unavailable")) });
        let (_dispatcher, mut caller) = setup(table, DispatcherConfig::default());

        caller.send(None, Message::Init { args: vec![] });
        assert_eq!(
            caller.next().await,
            Message::UnhandledError {
                error: Some(ErrorPayload::new("storage unavailable")),
            }
        );
        caller.nothing_more().await;
    }

    #[tokio::test]
    async fn ignore_unhandled_keeps_failures_local() {
        let table = MethodTable::new()
            .on_init(|_, _| async { Err(MethodError::failed("storage unavailable")) });
        let (_dispatcher, mut caller) =
            setup(table, DispatcherConfig::default().ignore_unhandled());

        caller.send(None, Message::Init { args: vec![] });
        caller.nothing_more().await;
    }

    #[tokio::test]
    async fn init_gets_an_update_sender() {
        let table = MethodTable::new().on_init(|ctx, args| async move {
            let update = Update::new("ready").with_field("args", args);
            ctx.updates.send(update).map_err(MethodError::failed)
        });
        let (_dispatcher, mut caller) = setup(table, DispatcherConfig::default());

        caller.send(None, Message::Init {
            args: vec![Value::from(true)],
        });
        assert_eq!(
            caller.next().await,
            Message::Update {
                update: Update::new("ready").with_field("args", vec![Value::from(true)]),
            }
        );
    }

    #[tokio::test]
    async fn other_channels_are_ignored() {
        let table = MethodTable::new().method("ping", |_, _| async { Ok(Value::from("pong")) });
        let (_dispatcher, mut caller) =
            setup(table, DispatcherConfig::default().with_channel("wallet"));

        caller.call("m1", "ping", vec![], false);
        caller.nothing_more().await;

        caller.send(
            Some("wallet"),
            Message::CallMethod {
                message_id: "m2".into(),
                name: "ping".into(),
                args: vec![],
                with_callback: false,
            },
        );
        assert!(matches!(
            caller.next().await,
            Message::MethodResponse { ref message_id, .. } if message_id == "m2"
        ));
    }

    #[tokio::test]
    async fn window_transport_filters_origin_and_passes_it_to_handlers() {
        let (dapp, wallet) = MemoryChannel::window("https://dapp.example", "https://wallet.example");
        let table = MethodTable::new().method("origin", |ctx, _| async move {
            Ok(ctx.origin().map(Value::from).unwrap_or_default())
        });
        let config = DispatcherConfig::default()
            .with_target_origin("https://dapp.example")
            .with_expected_origin("https://dapp.example");
        let _dispatcher = Dispatcher::new(wallet, Arc::new(table), config);
        let mut caller = FakeCaller::attach(dapp);

        caller.call("m1", "origin", vec![], false);
        assert_eq!(
            caller.next().await,
            Message::MethodResponse {
                message_id: "m1".into(),
                response: Value::from("https://dapp.example"),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn malformed_text_frame_is_dropped() {
        let table = MethodTable::new().method("ping", |_, _| async { Ok(Value::from("pong")) });
        let (near, far) = MemoryPort::pair("bridge", None);
        let _dispatcher = Dispatcher::new(near, Arc::new(table), DispatcherConfig::default());
        let mut caller = FakeCaller::attach(far.clone());

        far.post(Frame::Text("{not json".into()), None).unwrap();
        caller.nothing_more().await;

        caller.call("m1", "ping", vec![], false);
        assert_eq!(
            caller.next().await,
            Message::MethodResponse {
                message_id: "m1".into(),
                response: Value::from("pong"),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn stray_panics_are_reported_but_call_panics_are_not() {
        let table = MethodTable::new().method("explode", |_, _| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let (dispatcher, mut caller) = setup(table, DispatcherConfig::default().report_panics());

        caller.call("m1", "explode", vec![], false);
        assert!(matches!(
            caller.next().await,
            Message::MethodResponse { error: Some(_), .. }
        ));

        let stray = tokio::spawn(async {
            panic!("background job failed");
        });
        assert!(stray.await.is_err());
        match caller.next().await {
            Message::UnhandledError { error: Some(e) } => {
                assert_eq!(e.message, "panicked: background job failed");
                assert!(e.stack.is_some_and(|stack| stack.contains("dispatcher.rs")));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        caller.nothing_more().await;
        dispatcher.destroy();
    }

    #[tokio::test]
    async fn destroy_stops_listening() {
        let table = MethodTable::new().method("ping", |_, _| async { Ok(Value::from("pong")) });
        let (dispatcher, mut caller) = setup(table, DispatcherConfig::default());

        dispatcher.destroy();
        caller.call("m1", "ping", vec![], false);
        caller.nothing_more().await;
    }
}
