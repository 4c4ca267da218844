use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "calling_mode": state.config.calling.mode.to_string(),
        "dispatcher": state.config.dispatch.kind.to_string(),
        "pending_webhooks": state.waiters.len(),
    }))
}
