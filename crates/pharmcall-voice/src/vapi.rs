use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::{
    CallStatusReport, PlaceCallRequest, ProviderCallStatus, ProviderError, VoiceProvider,
};

/// Vapi outbound-call client.
pub struct VapiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    assistant_id: String,
    phone_number_id: String,
}

impl VapiProvider {
    pub fn new(
        api_key: String,
        assistant_id: String,
        phone_number_id: String,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| pharmcall_core::config::DEFAULT_VAPI_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            assistant_id,
            phone_number_id,
        }
    }

    fn build_call_body(&self, req: &PlaceCallRequest) -> Value {
        json!({
            "assistantId": self.assistant_id,
            "phoneNumberId": self.phone_number_id,
            "customer": {
                "number": req.phone,
                "name": req.pharmacy_name,
            },
            "assistantOverrides": {
                "variableValues": {
                    "pharmacyName": req.pharmacy_name,
                    "medicationName": req.medication_name,
                    "dosage": req.dosage.clone().unwrap_or_default(),
                }
            }
        })
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, ProviderError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "Vapi {what} failed");
        Err(ProviderError::Api {
            status,
            message: text,
        })
    }
}

#[derive(Deserialize)]
struct CreatedCall {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCall {
    id: String,
    #[serde(default)]
    status: Option<ProviderCallStatus>,
    #[serde(default)]
    ended_reason: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    artifact: Option<Artifact>,
}

#[derive(Deserialize)]
struct Artifact {
    #[serde(default)]
    transcript: Option<String>,
}

impl ApiCall {
    fn into_report(self) -> CallStatusReport {
        let duration_secs = match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u32,
            _ => 0,
        };
        let transcript = self
            .artifact
            .and_then(|a| a.transcript)
            .or(self.transcript);
        CallStatusReport {
            call_id: self.id,
            status: self.status.unwrap_or(ProviderCallStatus::Unknown),
            duration_secs,
            transcript,
            ended_reason: self.ended_reason,
        }
    }
}

#[async_trait]
impl VoiceProvider for VapiProvider {
    fn name(&self) -> &str {
        "vapi"
    }

    async fn place_call(&self, req: &PlaceCallRequest) -> Result<String, ProviderError> {
        let url = format!("{}/call", self.base_url);
        debug!(pharmacy = %req.pharmacy_name, "placing Vapi call");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_call_body(req))
            .send()
            .await?;
        let created: CreatedCall = Self::check(resp, "call create")
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(created.id)
    }

    async fn call_status(&self, call_id: &str) -> Result<CallStatusReport, ProviderError> {
        let url = format!("{}/call/{}", self.base_url, call_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let call: ApiCall = Self::check(resp, "call status")
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(call.into_report())
    }
}

/// Pull a finished-call report out of a Vapi server message.
///
/// Only `end-of-call-report` carries the transcript, so it is the only message
/// that resolves a call. A `status-update` with status `ended` arrives first
/// and without one; it and every other message type return `None`.
pub fn parse_webhook(body: &Value) -> Option<CallStatusReport> {
    let message = body.get("message").unwrap_or(body);
    if message.get("type")?.as_str()? != "end-of-call-report" {
        return None;
    }

    let call_id = message
        .get("call")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_str)?
        .to_string();
    let transcript = message
        .get("artifact")
        .and_then(|a| a.get("transcript"))
        .or_else(|| message.get("transcript"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let duration_secs = message
        .get("durationSeconds")
        .and_then(Value::as_f64)
        .map(|d| d.max(0.0).round() as u32)
        .unwrap_or(0);
    let ended_reason = message
        .get("endedReason")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(CallStatusReport {
        call_id,
        status: ProviderCallStatus::Ended,
        duration_secs,
        transcript,
        ended_reason,
    })
}
