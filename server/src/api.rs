//! # REST API Endpoints
//!
//! HTTP endpoints for querying server state. Currently only lists the
//! connected relay ports.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// Response item representing a single connected port.
#[derive(Debug, Serialize)]
pub struct PortListItem {
    pub id: String,
    pub name: String,
    pub origin: Option<String>,
}

/// `GET /api/ports` — Returns a JSON array of all currently connected ports.
pub async fn list_ports(State(state): State<AppState>) -> Json<Vec<PortListItem>> {
    let mut ports: Vec<PortListItem> = state
        .ports
        .iter()
        .map(|entry| PortListItem {
            id: entry.id.clone(),
            name: entry.name.clone(),
            origin: entry.origin.clone(),
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    Json(ports)
}
