use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pharmcall_core::config::CallingConfig;
use pharmcall_scheduler::{CallExecutor, CallOutcome, CallProvider, Job};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::extract::{confidence, extract, normalize_phone};
use crate::provider::{failure_reason, CallStatusReport, PlaceCallRequest, VoiceProvider};
use crate::waiters::CallWaiters;

/// Places real calls through a [`VoiceProvider`] and waits for them to end.
///
/// Completion comes from the webhook when one arrives; otherwise the call is
/// polled every `poll_interval`, at most `max_polls` times, after which the
/// attempt fails with `timeout`.
pub struct VoiceCallExecutor {
    provider: Arc<dyn VoiceProvider>,
    waiters: Arc<CallWaiters>,
    poll_interval: Duration,
    max_polls: u32,
}

impl VoiceCallExecutor {
    pub fn new(
        provider: Arc<dyn VoiceProvider>,
        waiters: Arc<CallWaiters>,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Self {
        Self {
            provider,
            waiters,
            poll_interval,
            max_polls,
        }
    }

    pub fn from_config(
        provider: Arc<dyn VoiceProvider>,
        waiters: Arc<CallWaiters>,
        cfg: &CallingConfig,
    ) -> Self {
        Self::new(
            provider,
            waiters,
            Duration::from_secs(cfg.poll_interval_secs),
            cfg.max_polls,
        )
    }

    async fn wait_for_end(
        &self,
        call_id: &str,
        rx: oneshot::Receiver<CallStatusReport>,
    ) -> Option<CallStatusReport> {
        let mut webhook = Some(rx);
        for poll in 1..=self.max_polls {
            let webhook_gone = match webhook.as_mut() {
                Some(rx) => tokio::select! {
                    res = rx => match res {
                        Ok(report) => return Some(report),
                        Err(_) => true,
                    },
                    _ = tokio::time::sleep(self.poll_interval) => false,
                },
                None => {
                    tokio::time::sleep(self.poll_interval).await;
                    false
                }
            };
            if webhook_gone {
                webhook = None;
            }

            match self.provider.call_status(call_id).await {
                Ok(report) if report.is_ended() => return Some(report),
                Ok(report) => debug!(%call_id, poll, status = ?report.status, "call still running"),
                Err(e) => warn!(%call_id, poll, "status poll failed: {e}"),
            }
        }
        None
    }

    fn outcome_from_report(report: CallStatusReport) -> CallOutcome {
        let ended_reason = report.ended_reason.as_deref();
        if let Some(reason) = ended_reason.and_then(failure_reason) {
            return CallOutcome {
                success: false,
                duration_secs: report.duration_secs,
                transcript: report.transcript,
                provider_call_id: Some(report.call_id),
                error: Some(reason.to_string()),
                ..CallOutcome::default()
            };
        }

        let transcript = report.transcript.unwrap_or_default();
        CallOutcome {
            success: true,
            duration_secs: report.duration_secs,
            extracted: Some(extract(&transcript)),
            confidence: Some(confidence(report.duration_secs, ended_reason)),
            transcript: Some(transcript),
            provider_call_id: Some(report.call_id),
            error: None,
        }
    }
}

#[async_trait]
impl CallExecutor for VoiceCallExecutor {
    fn provider(&self) -> CallProvider {
        CallProvider::Vapi
    }

    async fn execute(&self, job: &Job) -> CallOutcome {
        let Some(phone) = normalize_phone(&job.pharmacy_phone) else {
            warn!(job_id = %job.id, phone = %job.pharmacy_phone, "unusable phone number");
            return CallOutcome::failed("invalid_number");
        };

        let req = PlaceCallRequest {
            phone,
            pharmacy_name: job.pharmacy_name.clone(),
            medication_name: job.medication_name.clone(),
            dosage: job.dosage.clone(),
        };
        let call_id = match self.provider.place_call(&req).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job.id, provider = self.provider.name(), code = e.code(), "place call failed: {e}");
                return CallOutcome::failed("call_failed");
            }
        };
        info!(job_id = %job.id, %call_id, "call placed");

        let rx = self.waiters.register(&call_id);
        let report = self.wait_for_end(&call_id, rx).await;
        self.waiters.cancel(&call_id);

        match report {
            Some(report) => Self::outcome_from_report(report),
            None => {
                warn!(job_id = %job.id, %call_id, "call did not finish in time");
                CallOutcome {
                    provider_call_id: Some(call_id),
                    ..CallOutcome::failed("timeout")
                }
            }
        }
    }
}
