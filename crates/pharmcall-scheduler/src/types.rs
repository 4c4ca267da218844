use chrono::{DateTime, Utc};
use pharmcall_core::{JobId, PharmacyId, SearchId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Human-readable reasons stored on jobs. These are what end users see.
pub const RATE_LIMITED_REASON: &str = "Rate limited - called too recently";
pub const ENQUEUE_FAILED_REASON: &str = "Failed to enqueue job";
pub const MAX_RETRIES_REASON: &str = "Max retries exceeded";

/// Lifecycle state of a pharmacy-call job.
///
/// `pending → processing → {completed | retry_scheduled | failed}` and
/// `retry_scheduled → processing` on the next delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for its first delivery.
    Pending,
    /// A delivery owns the job and a call is being placed.
    Processing,
    /// Waiting for a delayed delivery (retry backoff or next calling window).
    RetryScheduled,
    /// Terminal: the call succeeded.
    Completed,
    /// Terminal: rate limited, enqueue failure, or attempts exhausted.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "retry_scheduled" => Ok(JobStatus::RetryScheduled),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Structured answer pulled out of a call transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    /// `None` when the transcript neither confirmed nor denied stock.
    pub availability: Option<bool>,
    pub price: Option<f64>,
    pub notes: String,
}

/// A persisted pharmacy-call job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub search_id: SearchId,
    pub pharmacy_id: PharmacyId,
    pub pharmacy_name: String,
    pub pharmacy_phone: String,
    pub pharmacy_address: String,
    pub medication_name: String,
    pub dosage: Option<String>,
    pub user_id: Option<UserId>,
    pub status: JobStatus,
    /// 1-based attempt currently being worked on. Never exceeds `max_attempts`.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Only set while `status == RetryScheduled`.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<ExtractedData>,
    pub dispatcher_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Insert payload for [`crate::store::JobStore::create_jobs`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub search_id: SearchId,
    pub pharmacy_id: PharmacyId,
    pub pharmacy_name: String,
    pub pharmacy_phone: String,
    pub pharmacy_address: String,
    pub medication_name: String,
    pub dosage: Option<String>,
    pub user_id: Option<UserId>,
    pub max_attempts: u32,
}

impl NewJob {
    /// Denormalise one selected pharmacy of `search` into a job row.
    pub fn for_pharmacy(search: &Search, pharmacy: &SelectedPharmacy, max_attempts: u32) -> Self {
        Self {
            search_id: search.id.clone(),
            pharmacy_id: pharmacy.id.clone(),
            pharmacy_name: pharmacy.name.clone(),
            pharmacy_phone: pharmacy.phone.clone(),
            pharmacy_address: pharmacy.address.clone(),
            medication_name: search.medication_name.clone(),
            dosage: search.dosage.clone(),
            user_id: search.user_id.clone(),
            max_attempts,
        }
    }

    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            search_id: self.search_id,
            pharmacy_id: self.pharmacy_id,
            pharmacy_name: self.pharmacy_name,
            pharmacy_phone: self.pharmacy_phone,
            pharmacy_address: self.pharmacy_address,
            medication_name: self.medication_name,
            dosage: self.dosage,
            user_id: self.user_id,
            status: JobStatus::Pending,
            attempt_count: 1,
            max_attempts: self.max_attempts,
            scheduled_for: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
            dispatcher_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a job. `None` leaves a field untouched; `Some(None)`
/// clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempt_count: Option<u32>,
    pub scheduled_for: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub result: Option<Option<ExtractedData>>,
    pub dispatcher_message_id: Option<Option<String>>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_count = Some(attempt);
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(Some(at));
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(Some(at));
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(Some(at));
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error_message = Some(error);
        self
    }

    pub fn with_result(mut self, result: Option<ExtractedData>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_message_id(mut self, message_id: String) -> Self {
        self.dispatcher_message_id = Some(Some(message_id));
        self
    }

    /// Apply onto `job`. The attempt counter only moves forward and is capped
    /// at `max_attempts`; `scheduled_for` is dropped whenever the resulting
    /// status is not `RetryScheduled`.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempt) = self.attempt_count {
            job.attempt_count = attempt.max(job.attempt_count).min(job.max_attempts);
        }
        if let Some(at) = self.scheduled_for {
            job.scheduled_for = at;
        }
        if let Some(at) = self.started_at {
            job.started_at = at;
        }
        if let Some(at) = self.completed_at {
            job.completed_at = at;
        }
        if let Some(ref err) = self.error_message {
            job.error_message = err.clone();
        }
        if let Some(ref result) = self.result {
            job.result = result.clone();
        }
        if let Some(ref id) = self.dispatcher_message_id {
            job.dispatcher_message_id = id.clone();
        }
        if job.status != JobStatus::RetryScheduled {
            job.scheduled_for = None;
        }
        job.updated_at = now;
    }
}

/// Which backend realised a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallProvider {
    Vapi,
    Simulated,
}

impl std::fmt::Display for CallProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallProvider::Vapi => write!(f, "vapi"),
            CallProvider::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for CallProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vapi" => Ok(CallProvider::Vapi),
            "simulated" => Ok(CallProvider::Simulated),
            other => Err(format!("unknown call provider: {other}")),
        }
    }
}

/// Status of a single realised call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Completed,
    Failed,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "ringing" => Ok(CallStatus::Ringing),
            "answered" => Ok(CallStatus::Answered),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// One realised phone-call attempt; child of a [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub job_id: JobId,
    pub attempt: u32,
    pub provider: CallProvider,
    pub status: CallStatus,
    pub duration_secs: u32,
    pub transcript: Option<String>,
    pub result: Option<ExtractedData>,
    /// 0.0–1.0; only set for calls that produced a transcript.
    pub confidence: Option<f64>,
    pub provider_call_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    pub fn initiated(job: &Job, provider: CallProvider, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            attempt: job.attempt_count,
            provider,
            status: CallStatus::Initiated,
            duration_secs: 0,
            transcript: None,
            result: None,
            confidence: None,
            provider_call_id: None,
            error_message: None,
            created_at: now,
            ended_at: None,
        }
    }

    /// Fold the executor's outcome into the record.
    pub fn finish(&mut self, outcome: &crate::executor::CallOutcome, now: DateTime<Utc>) {
        self.status = if outcome.success {
            CallStatus::Completed
        } else {
            CallStatus::Failed
        };
        self.duration_secs = outcome.duration_secs;
        self.transcript = outcome.transcript.clone();
        self.result = outcome.extracted.clone();
        self.confidence = outcome.confidence;
        self.provider_call_id = outcome.provider_call_id.clone();
        self.error_message = outcome.error.clone();
        self.ended_at = Some(now);
    }
}

/// Search lifecycle as far as this subsystem touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    PendingPayment,
    PaymentCompleted,
    CallingInProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SearchStatus::PendingPayment => "pending_payment",
            SearchStatus::PaymentCompleted => "payment_completed",
            SearchStatus::CallingInProgress => "calling_in_progress",
            SearchStatus::Completed => "completed",
            SearchStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SearchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(SearchStatus::PendingPayment),
            "payment_completed" => Ok(SearchStatus::PaymentCompleted),
            "calling_in_progress" => Ok(SearchStatus::CallingInProgress),
            "completed" => Ok(SearchStatus::Completed),
            "failed" => Ok(SearchStatus::Failed),
            other => Err(format!("unknown search status: {other}")),
        }
    }
}

/// A pharmacy the user picked from the places lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedPharmacy {
    pub id: PharmacyId,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub address: String,
}

/// The slice of a search record the scheduler reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Search {
    pub id: SearchId,
    pub user_id: Option<UserId>,
    pub medication_name: String,
    pub dosage: Option<String>,
    pub status: SearchStatus,
    pub selected_pharmacies: Vec<SelectedPharmacy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of `start_calling`: partial failure is reported, not raised.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub search_id: SearchId,
    pub jobs_created: usize,
    pub enqueued: usize,
    pub failed: usize,
    /// Jobs that already existed past `pending` and were left alone.
    pub skipped: usize,
    pub delay_secs: u64,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Why a delivery was dropped without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Job already `completed` or `failed`.
    AlreadyTerminal,
    /// Another delivery is currently processing the job.
    InFlight,
    /// Delivery carries an attempt number the job has moved past.
    StaleAttempt,
    /// A concurrent delivery won the conditional transition.
    LostRace,
}

/// What `process_job` did with one delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Skipped { reason: SkipReason },
    RateLimited,
    /// Outside the calling window; re-delivered at the next opening.
    Rescheduled { scheduled_for: DateTime<Utc> },
    Completed,
    RetryScheduled { attempt: u32, scheduled_for: DateTime<Utc> },
    Failed { error: String },
}

/// Per-search job counts for the operator surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub failed: usize,
    /// Call attempts that reached the executor, across all jobs.
    pub total_calls: usize,
    /// completed / (completed + failed); 0.0 until a job reaches a terminal state.
    pub success_rate: f64,
}

impl JobMetrics {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut m = JobMetrics {
            total: jobs.len(),
            ..Self::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Pending => m.pending += 1,
                JobStatus::Processing => m.processing += 1,
                JobStatus::RetryScheduled => m.retry_scheduled += 1,
                JobStatus::Completed => m.completed += 1,
                JobStatus::Failed => m.failed += 1,
            }
        }
        let finished = m.completed + m.failed;
        if finished > 0 {
            m.success_rate = m.completed as f64 / finished as f64;
        }
        m
    }
}
