//! # Outbound Messages
//!
//! Everything a callee sends goes through an [`Outbox`] bound to one
//! transport and one logical channel. Method handlers never see the
//! transport; they get the narrower [`Progress`] and [`UpdateSender`]
//! handles built on top of it.

use bridge_protocol::transport::post_envelope;
use bridge_protocol::{
    Envelope, ErrorPayload, Message, MessageId, Transport, TransportError, Update, Value,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Sends envelopes tagged with one channel on one transport, addressing
/// window-like peers with the configured target origin.
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn Transport>,
    channel: Option<String>,
    target_origin: Option<String>,
}

impl Outbox {
    /// `target_origin` is only used when the transport needs one.
    pub fn new(transport: Arc<dyn Transport>, channel: Option<String>, target_origin: &str) -> Self {
        let target_origin = transport
            .requires_target_origin()
            .then(|| target_origin.to_owned());
        Self {
            transport,
            channel,
            target_origin,
        }
    }

    /// Posts `message` on the bound channel, moving `transfer` zero-copy
    /// where the transport allows it.
    pub fn send(&self, message: Message, transfer: Vec<Bytes>) -> Result<(), TransportError> {
        // A window-like peer may sit on a different origin; buffers are
        // copied to it, never moved.
        let transfer = if !transfer.is_empty() && self.transport.requires_target_origin() {
            warn!(
                kind = message.kind(),
                buffers = transfer.len(),
                "zero-copy transfer not allowed on this transport, copying"
            );
            Vec::new()
        } else {
            transfer
        };
        let envelope = Envelope::new(self.channel.clone(), message);
        post_envelope(
            self.transport.as_ref(),
            envelope,
            transfer,
            self.target_origin.as_deref(),
        )
    }

    /// Sends an `unhandledError`. Failures to send are only logged.
    pub fn report_unhandled(&self, message: impl Into<String>, stack: Option<String>) {
        let message = message.into();
        error!(%message, "unhandled error in callee context");
        let error = ErrorPayload { message, stack };
        if let Err(e) = self.send(Message::UnhandledError { error: Some(error) }, Vec::new()) {
            warn!("Failed to report unhandled error: {}", e);
        }
    }
}

/// Pushes `update` messages to the caller this handle was created for.
#[derive(Clone)]
pub struct UpdateSender {
    outbox: Outbox,
}

impl UpdateSender {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }

    /// Sends one `update`. Fails only if the transport is gone.
    pub fn send(&self, update: Update) -> Result<(), TransportError> {
        self.outbox.send(Message::Update { update }, Vec::new())
    }
}

/// Streaming progress sink handed to a method called with a callback.
#[derive(Clone)]
pub struct Progress {
    message_id: MessageId,
    canceled: Arc<AtomicBool>,
    outbox: Outbox,
}

impl Progress {
    pub(crate) fn new(message_id: MessageId, canceled: Arc<AtomicBool>, outbox: Outbox) -> Self {
        Self {
            message_id,
            canceled,
            outbox,
        }
    }

    /// Sends one `methodCallback`. A trailing byte buffer is moved, not
    /// copied.
    pub fn send(&self, args: Vec<Value>) -> Result<(), TransportError> {
        let transfer = match args.last() {
            Some(Value::Bytes(bytes)) => vec![bytes.clone()],
            _ => Vec::new(),
        };
        self.outbox.send(
            Message::MethodCallback {
                message_id: self.message_id.clone(),
                callback_args: args,
            },
            transfer,
        )
    }

    /// Set once the caller sent `cancelProgress`. Methods poll it and stop
    /// when they see fit.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}
