//! Voice provider webhook, POST /webhooks/voice.
//!
//! Vapi posts server messages for every call event. Only the
//! end-of-call report matters here: it carries the transcript and wakes the
//! executor waiting on that call id. Everything else, including the earlier
//! `status-update` with status `ended`, is acknowledged and dropped.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use pharmcall_voice::vapi::parse_webhook;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::auth::verify_voice_secret;
use crate::http::error::ApiError;

pub async fn voice_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    verify_voice_secret(&headers, state.config.voice.webhook_secret.as_deref())
        .map_err(ApiError::Unauthorized)?;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "invalid JSON in voice webhook body");
        ApiError::MalformedPayload("invalid JSON body".to_string())
    })?;

    let Some(report) = parse_webhook(&payload) else {
        debug!("voice webhook ignored");
        return Ok(Json(json!({"ok": true, "resolved": false})));
    };

    let call_id = report.call_id.clone();
    let resolved = state.waiters.resolve(report);
    // an unmatched report is normal: the poll may have won, or another replica owns the call
    info!(%call_id, resolved, "end-of-call webhook");
    Ok(Json(json!({"ok": true, "resolved": resolved})))
}
