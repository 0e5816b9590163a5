//! # Bridge Server
//!
//! Callee side of the cross-context RPC bridge, plus the WebSocket relay
//! that carries it between processes.
//!
//! ## Module Structure
//! - `api`        — HTTP endpoints (connected port list)
//! - `demo`       — the method table served by the `bridge-server` binary
//! - `dispatcher` — runs `init` / `callMethod` / `cancelProgress` against a table
//! - `outbox`     — outbound messages, progress and update senders
//! - `serve`      — serving tables on accepted or self-opened relay ports
//! - `state`      — shared application state
//! - `table`      — method tables and their errors
//! - `ws`         — WebSocket relay ports

pub mod api;
pub mod demo;
pub mod dispatcher;
pub mod outbox;
pub mod serve;
pub mod state;
pub mod table;
pub mod ws;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use outbox::{Progress, UpdateSender};
pub use serve::{origin_of, serve_ports, serve_reverse_port, PortService, ServeOptions};
pub use state::AppState;
pub use table::{CallContext, InitContext, MethodError, MethodTable};
pub use ws::WsPortHub;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

/// Builds the HTTP router: relay ports under `/port/{name}` and the API
/// under `/api`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/port/{name}", get(ws::port_handler))
        .route("/api/ports", get(api::list_ports))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
