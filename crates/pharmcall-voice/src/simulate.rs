use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pharmcall_scheduler::{CallExecutor, CallOutcome, CallProvider, Job};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;
use uuid::Uuid;

use crate::extract::{confidence, extract, normalize_phone};

const FAILURE_REASONS: &[&str] = &["no_answer", "busy", "invalid_number", "call_failed"];

/// Stand-in call executor for local runs and demos. Produces plausible
/// transcripts and runs them through the same extraction as real calls.
pub struct SimulatedExecutor {
    rng: Mutex<StdRng>,
    success_rate: f64,
    latency: Option<Duration>,
}

/// Everything random about one simulated call, drawn under the lock.
struct Draw {
    duration_secs: u32,
    success: bool,
    in_stock: bool,
    price: f64,
    failure: &'static str,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic outcomes for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            success_rate: 0.88,
            latency: None,
        }
    }

    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sleep this long per call to mimic a real conversation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn draw(&self) -> Draw {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let cents: u32 = rng.gen_range(1500..25000);
        Draw {
            duration_secs: rng.gen_range(30..=150),
            success: rng.gen_bool(self.success_rate),
            in_stock: rng.gen_bool(0.7),
            price: f64::from(cents) / 100.0,
            failure: FAILURE_REASONS.choose(&mut *rng).copied().unwrap_or("call_failed"),
        }
    }
}

fn transcript(job: &Job, in_stock: bool, price: f64) -> String {
    let medication = match &job.dosage {
        Some(d) => format!("{} {}", job.medication_name, d),
        None => job.medication_name.clone(),
    };
    let greeting = format!(
        "Pharmacist: Thank you for calling {}, how can I help?\n\
         Assistant: Hi, I'm checking whether you have {} available.\n",
        job.pharmacy_name, medication
    );
    let answer = if in_stock {
        format!("Pharmacist: Yes, we have it in stock. The cash price is ${price:.2}.\n")
    } else {
        "Pharmacist: Sorry, we're out of stock on that right now. Try again next week.\n".to_string()
    };
    format!("{greeting}{answer}Assistant: Thank you, goodbye.")
}

#[async_trait]
impl CallExecutor for SimulatedExecutor {
    fn provider(&self) -> CallProvider {
        CallProvider::Simulated
    }

    async fn execute(&self, job: &Job) -> CallOutcome {
        if normalize_phone(&job.pharmacy_phone).is_none() {
            return CallOutcome::failed("invalid_number");
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let draw = self.draw();
        let call_id = format!("sim-{}", Uuid::new_v4());
        debug!(job_id = %job.id, success = draw.success, "simulated call");

        if !draw.success {
            return CallOutcome {
                duration_secs: draw.duration_secs.min(30),
                provider_call_id: Some(call_id),
                ..CallOutcome::failed(draw.failure)
            };
        }

        let text = transcript(job, draw.in_stock, draw.price);
        CallOutcome {
            success: true,
            duration_secs: draw.duration_secs,
            extracted: Some(extract(&text)),
            confidence: Some(confidence(draw.duration_secs, Some("assistant-ended-call"))),
            transcript: Some(text),
            provider_call_id: Some(call_id),
            error: None,
        }
    }
}
