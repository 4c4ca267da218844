use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pharmcall_scheduler::SchedulerError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Admin routes with no admin token configured.
    #[error("admin API is disabled")]
    AdminDisabled,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Scheduler(e) => e.code(),
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::AdminDisabled => "ADMIN_DISABLED",
            ApiError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Scheduler(SchedulerError::SearchNotFound { .. })
            | ApiError::Scheduler(SchedulerError::JobNotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Scheduler(SchedulerError::NoPharmaciesSelected { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::AdminDisabled => StatusCode::FORBIDDEN,
            ApiError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // storage and dispatcher internals stay in the log
        let message = if status.is_server_error() {
            error!(code = self.code(), error = %self, "request failed");
            "internal error".to_string()
        } else {
            warn!(code = self.code(), error = %self, "request rejected");
            self.to_string()
        };
        (status, Json(json!({"error": message, "code": self.code()}))).into_response()
    }
}
