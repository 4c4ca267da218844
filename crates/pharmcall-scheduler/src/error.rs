use thiserror::Error;

use crate::dispatch::DispatchError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded (bad timestamp, unknown status, ...).
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,

    /// Calling window configured with an unknown IANA zone.
    #[error("Unknown time zone: {0}")]
    InvalidTimezone(String),

    /// Opening hours that cannot be resolved to an instant.
    #[error("Invalid calling window: {0}")]
    InvalidWindow(String),

    #[error("Search not found: {id}")]
    SearchNotFound { id: String },

    /// Business rule: a search must select at least one pharmacy before calling starts.
    #[error("No pharmacies selected for search {id}")]
    NoPharmaciesSelected { id: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl SchedulerError {
    /// Short error code string used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Corrupt(_) => "CORRUPT_RECORD",
            SchedulerError::Poisoned => "INTERNAL_ERROR",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::InvalidWindow(_) => "INVALID_WINDOW",
            SchedulerError::SearchNotFound { .. } => "SEARCH_NOT_FOUND",
            SchedulerError::NoPharmaciesSelected { .. } => "NO_PHARMACIES_SELECTED",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Dispatch(_) => "DISPATCH_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
