//! Operator routes under `/admin/searches/{id}`, guarded by the admin bearer token.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use pharmcall_core::SearchId;
use pharmcall_scheduler::{CallRecord, Job, JobMetrics, StartReport};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::app::AppState;
use crate::auth::verify_bearer_token;
use crate::http::error::ApiError;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = state
        .config
        .gateway
        .admin_token
        .as_deref()
        .ok_or(ApiError::AdminDisabled)?;
    verify_bearer_token(headers, token).map_err(ApiError::Unauthorized)
}

/// POST /admin/searches/{id}/start
pub async fn start_calling(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StartReport>, ApiError> {
    require_admin(&state, &headers)?;
    let report = state.scheduler.start_calling(&SearchId::from(id)).await?;
    Ok(Json(report))
}

/// POST /admin/searches/{id}/complete
///
/// Pending dispatcher deliveries are not cancelled; they find their jobs and
/// run them to a terminal state as usual.
pub async fn complete_search(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers)?;
    state.scheduler.complete_search(&SearchId::from(id.as_str())).await?;
    info!(search_id = %id, "search completed by operator");
    Ok(Json(json!({"ok": true, "search_id": id})))
}

#[derive(Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub latest_call: Option<CallRecord>,
}

/// GET /admin/searches/{id}/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<JobView>>, ApiError> {
    require_admin(&state, &headers)?;
    let jobs = state.scheduler.jobs_for_search(&SearchId::from(id)).await?;

    let mut views = Vec::with_capacity(jobs.len());
    for job in jobs {
        let latest_call = state
            .scheduler
            .call_records(&job.id)
            .await?
            .into_iter()
            .max_by_key(|r| r.created_at);
        views.push(JobView { job, latest_call });
    }
    Ok(Json(views))
}

/// GET /admin/searches/{id}/metrics
pub async fn search_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JobMetrics>, ApiError> {
    require_admin(&state, &headers)?;
    let metrics = state.scheduler.metrics(&SearchId::from(id)).await?;
    Ok(Json(metrics))
}
