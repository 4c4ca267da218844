use axum::{
    routing::{get, post},
    Router,
};
use pharmcall_core::PharmcallConfig;
use pharmcall_scheduler::CallScheduler;
use pharmcall_voice::CallWaiters;
use std::sync::Arc;

/// Shared state handed to every Axum handler as `Arc<AppState>`.
pub struct AppState {
    pub config: PharmcallConfig,
    pub scheduler: Arc<CallScheduler>,
    /// Real-mode calls waiting for their end-of-call webhook.
    pub waiters: Arc<CallWaiters>,
}

impl AppState {
    pub fn new(
        config: PharmcallConfig,
        scheduler: Arc<CallScheduler>,
        waiters: Arc<CallWaiters>,
    ) -> Self {
        Self {
            config,
            scheduler,
            waiters,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/jobs/process", post(crate::http::jobs::process_handler))
        .route("/webhooks/voice", post(crate::http::webhooks::voice_webhook_handler))
        .route(
            "/admin/searches/{id}/start",
            post(crate::http::admin::start_calling),
        )
        .route(
            "/admin/searches/{id}/complete",
            post(crate::http::admin::complete_search),
        )
        .route("/admin/searches/{id}/jobs", get(crate::http::admin::list_jobs))
        .route(
            "/admin/searches/{id}/metrics",
            get(crate::http::admin::search_metrics),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
