use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the assistant needs to know to place one call.
#[derive(Debug, Clone)]
pub struct PlaceCallRequest {
    /// E.164 number, already normalised.
    pub phone: String,
    pub pharmacy_name: String,
    pub medication_name: String,
    pub dosage: Option<String>,
}

/// Provider-side lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderCallStatus {
    Queued,
    Ringing,
    InProgress,
    Forwarding,
    Ended,
    #[serde(other)]
    Unknown,
}

/// Snapshot of a call, from a status poll or a webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatusReport {
    pub call_id: String,
    pub status: ProviderCallStatus,
    pub duration_secs: u32,
    pub transcript: Option<String>,
    /// Provider's end reason, e.g. `customer-ended-call` or `customer-busy`.
    pub ended_reason: Option<String>,
}

impl CallStatusReport {
    pub fn is_ended(&self) -> bool {
        self.status == ProviderCallStatus::Ended
    }
}

/// A phone-calling AI service.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Start an outbound call and return the provider's call id.
    async fn place_call(&self, req: &PlaceCallRequest) -> Result<String, ProviderError>;

    async fn call_status(&self, call_id: &str) -> Result<CallStatusReport, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider not configured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Http(_) => "PROVIDER_HTTP_ERROR",
            ProviderError::Api { .. } => "PROVIDER_API_ERROR",
            ProviderError::Parse(_) => "PROVIDER_PARSE_ERROR",
            ProviderError::Config(_) => "PROVIDER_CONFIG_ERROR",
        }
    }
}

/// Map a provider end reason onto the failure vocabulary stored on jobs.
/// `None` means the call ended normally.
pub fn failure_reason(ended_reason: &str) -> Option<&'static str> {
    match ended_reason {
        "customer-did-not-answer" | "voicemail" => Some("no_answer"),
        "customer-busy" => Some("busy"),
        "twilio-failed-to-connect-call" | "phone-call-provider-bypass-enabled-but-no-call-received" => {
            Some("call_failed")
        }
        r if r.contains("error") => Some("call_failed"),
        _ => None,
    }
}
