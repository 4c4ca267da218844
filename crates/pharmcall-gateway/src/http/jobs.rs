//! Dispatcher callback, POST /jobs/process.
//!
//! QStash (or anything speaking the same contract) delivers a [`JobTask`]
//! here, possibly more than once. Duplicates come back as `skipped`.
//! QStash authenticates with the bearer it was told to forward; other relays
//! may sign the body instead.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use pharmcall_scheduler::{JobTask, ProcessOutcome};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::verify_dispatch;
use crate::http::error::ApiError;

/// POST /jobs/process
///
/// 200 with the outcome once the delivery is handled (including skips),
/// 404 for a job that does not exist, 5xx when the dispatcher should retry.
pub async fn process_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ProcessOutcome>, ApiError> {
    verify_dispatch(
        &headers,
        &body,
        state.config.dispatch.signing_secret.as_deref(),
        state.config.dispatch.callback_bearer(&state.config.gateway),
    )
    .map_err(ApiError::Unauthorized)?;

    let task: JobTask = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "invalid job task body");
        ApiError::MalformedPayload(e.to_string())
    })?;

    info!(
        search_id = %task.search_id,
        pharmacy_id = %task.pharmacy_id,
        attempt = task.attempt,
        "job delivery"
    );
    let outcome = state.scheduler.process_job(&task).await?;
    Ok(Json(outcome))
}
