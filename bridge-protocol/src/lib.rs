//! # Bridge Protocol
//!
//! The contract shared by the caller side (`bridge-client`) and the callee
//! side (`bridge-server`) of the cross-context RPC bridge:
//!
//! - [`message`]: the tagged-union wire messages and their `channel` envelope
//! - [`value`]: the structured value model carried in arguments and responses
//! - [`codec`]: the text codec used by string-only relay ports
//! - [`transport`]: the injected transport interface, ports, openers and acceptors
//! - [`memory`]: in-process implementations of every transport model
//!
//! Structured transports move [`Envelope`]s as they are; text transports
//! carry them as JSON produced by [`codec::encode`].

pub mod codec;
pub mod memory;
pub mod message;
pub mod transport;
pub mod value;

pub use codec::CodecError;
pub use message::{Envelope, ErrorPayload, Message, MessageId, Update};
pub use transport::{
    Carrier, ConnectListener, Detached, DisconnectSignal, Frame, Inbound, Listener, ListenerId,
    Listeners, Port, PortAcceptor, PortOpener, Transport, TransportError,
};
pub use value::Value;
