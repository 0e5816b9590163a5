//! # Bridge Client
//!
//! Caller side of the cross-context RPC bridge.
//!
//! ## Module Structure
//! - `config`    — connector and port adapter settings
//! - `connector` — request/response correlation over one transport
//! - `error`     — call and send errors
//! - `port`      — reconnecting adapter for relay ports
//! - `reverse`   — connector that waits for the other side to attach
//! - `state`     — pending-call and callback tables
//! - `ws`        — WebSocket relay ports

pub mod config;
pub mod connector;
pub mod error;
pub mod port;
pub mod reverse;
pub mod state;
pub mod ws;

pub use config::{ConnectorConfig, PendingPolicy, PortAdapterConfig};
pub use connector::{Connector, Handlers, PendingResponse, Request, WeakConnector};
pub use error::{CallError, ConnectorError, RemoteError};
pub use port::{PortAdapter, PortState};
pub use reverse::ReverseConnector;
pub use state::{CallbackId, ProgressCallback};
pub use ws::{WsPort, WsPortOpener};
