//! # Server State
//!
//! Holds the shared application state for the bridge server:
//! - **Port registry**: connected WebSocket ports, keyed by port ID, for
//!   the HTTP API
//! - **Port hub**: announces new ports to the method tables served on them
//!
//! The registry uses [`DashMap`] since every WebSocket is handled by its own
//! task.

use crate::ws::WsPortHub;
use dashmap::DashMap;
use std::sync::Arc;

/// Information stored for each connected port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Unique identifier of the WebSocket connection (UUID).
    pub id: String,

    /// Name the port was opened with (the `{name}` path segment).
    pub name: String,

    /// The `Origin` header of the upgrade request, if any.
    pub origin: Option<String>,
}

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    pub ports: Arc<DashMap<String, PortInfo>>,
    pub hub: Arc<WsPortHub>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(DashMap::new()),
            hub: Arc::new(WsPortHub::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
