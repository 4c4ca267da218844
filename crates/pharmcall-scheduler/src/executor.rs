use async_trait::async_trait;

use crate::types::{CallProvider, ExtractedData, Job};

/// Normalised result of one call attempt, whatever backend placed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOutcome {
    pub success: bool,
    pub duration_secs: u32,
    pub transcript: Option<String>,
    pub extracted: Option<ExtractedData>,
    pub confidence: Option<f64>,
    pub provider_call_id: Option<String>,
    /// Short reason such as `no_answer`, `busy`, `invalid_number`,
    /// `call_failed` or `timeout`.
    pub error: Option<String>,
}

impl CallOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Error text for job bookkeeping; never empty on failure.
    pub fn error_text(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "call_failed".to_string())
    }
}

/// Places one call for a job and reports what happened.
///
/// Implementations must not return errors: every failure mode is folded into
/// a failed [`CallOutcome`].
#[async_trait]
pub trait CallExecutor: Send + Sync {
    fn provider(&self) -> CallProvider;

    async fn execute(&self, job: &Job) -> CallOutcome;
}
