//! # Wire Messages
//!
//! Defines every message exchanged between a connector (caller) and a
//! dispatcher (callee). Messages use serde's internally-tagged
//! representation: the `type` field carries the camelCase variant name, so
//! `Message::CallMethod { .. }` is `{"type": "callMethod", ...}`.
//!
//! Every message travels inside an [`Envelope`] that adds the optional
//! logical `channel`. Receivers only act on envelopes whose channel equals
//! their own, which lets several connectors share one physical transport.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Correlates a `callMethod` with its callbacks and its response.
pub type MessageId = String;

/// A message plus the logical channel it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(channel: Option<String>, message: Message) -> Self {
        Self { channel, message }
    }

    /// `true` when the envelope belongs to the receiver's channel.
    /// A channel-less envelope only matches a channel-less receiver.
    pub fn is_for(&self, channel: Option<&str>) -> bool {
        self.channel.as_deref() == channel
    }
}

/// All possible bridge messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    // ── Caller → Callee ───────────────────────────────────────────

    /// One-way initialization. No response is sent back.
    Init {
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Invokes `name` on the callee. `with_callback` asks the callee to
    /// stream progress back as `MethodCallback` messages.
    CallMethod {
        message_id: MessageId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        with_callback: bool,
    },

    /// Asks the callee to stop streaming progress for `message_id`.
    /// Advisory only: the running method decides when to stop.
    CancelProgress { message_id: MessageId },

    // ── Callee → Caller ───────────────────────────────────────────

    /// Unsolicited push from the callee.
    Update { update: Update },

    /// Final outcome of a call. A missing `response` is the undefined value.
    MethodResponse {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Value::is_undefined")]
        response: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// Intermediate progress for a call made with `with_callback`.
    MethodCallback {
        message_id: MessageId,
        #[serde(default)]
        callback_args: Vec<Value>,
    },

    /// An error in the callee context that no call can be blamed for.
    UnhandledError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

impl Message {
    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Init { .. } => "init",
            Message::CallMethod { .. } => "callMethod",
            Message::CancelProgress { .. } => "cancelProgress",
            Message::Update { .. } => "update",
            Message::MethodResponse { .. } => "methodResponse",
            Message::MethodCallback { .. } => "methodCallback",
            Message::UnhandledError { .. } => "unhandledError",
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Message::CallMethod { message_id, .. }
            | Message::CancelProgress { message_id }
            | Message::MethodResponse { message_id, .. }
            | Message::MethodCallback { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

/// Error shape carried by `methodResponse` and `unhandledError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Payload of an `update` push: `{"type": kind, ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Update {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}
