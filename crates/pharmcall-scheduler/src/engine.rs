use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use pharmcall_core::{JobId, SearchId};
use tracing::{error, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    dispatch::{JobTask, TaskDispatcher},
    error::{Result, SchedulerError},
    executor::{CallExecutor, CallOutcome},
    rate::RateGuard,
    retry::RetryPolicy,
    store::{JobStore, SearchStore},
    types::{
        CallRecord, Job, JobMetrics, JobPatch, JobStatus, NewJob, ProcessOutcome, SearchStatus,
        SkipReason, StartReport, ENQUEUE_FAILED_REASON, MAX_RETRIES_REASON, RATE_LIMITED_REASON,
    },
    window::CallingWindow,
};

/// States from which a delivery may take ownership of a job.
const RUNNABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::RetryScheduled];

/// How long a job may sit in `processing` before a delivery of the same
/// attempt treats it as abandoned.
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 600;

enum Enqueued {
    Yes,
    Failed,
    Skipped,
}

/// Orchestrates job creation, delivery handling and retries for pharmacy calls.
///
/// Holds only shared handles, so one instance serves every concurrent
/// delivery.
pub struct CallScheduler {
    jobs: Arc<dyn JobStore>,
    searches: Arc<dyn SearchStore>,
    rate_guard: RateGuard,
    window: CallingWindow,
    retry: RetryPolicy,
    executor: Arc<dyn CallExecutor>,
    dispatcher: Arc<dyn TaskDispatcher>,
    clock: Arc<dyn Clock>,
    processing_timeout: Duration,
}

impl CallScheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        searches: Arc<dyn SearchStore>,
        rate_guard: RateGuard,
        window: CallingWindow,
        retry: RetryPolicy,
        executor: Arc<dyn CallExecutor>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            jobs,
            searches,
            rate_guard,
            window,
            retry,
            executor,
            dispatcher,
            clock: Arc::new(SystemClock),
            processing_timeout: Duration::seconds(DEFAULT_PROCESSING_TIMEOUT_SECS as i64),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Should exceed the executor's own hard bound on a call.
    pub fn with_processing_timeout(mut self, timeout_secs: u64) -> Self {
        self.processing_timeout = Duration::seconds(timeout_secs as i64);
        self
    }

    /// A `processing` job whose call outlived any executor bound: the
    /// delivery that claimed it crashed or lost its store connection.
    fn is_abandoned(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::Processing
            && job
                .started_at
                .map_or(true, |at| at <= now - self.processing_timeout)
    }

    /// Create one job per selected pharmacy and enqueue each for delivery.
    ///
    /// Safe to call again for the same search: existing jobs are reused and
    /// only never-enqueued `pending` jobs are dispatched.
    pub async fn start_calling(&self, search_id: &SearchId) -> Result<StartReport> {
        let now = self.clock.now();
        let search = self
            .searches
            .get_search(search_id)
            .await?
            .ok_or_else(|| SchedulerError::SearchNotFound {
                id: search_id.to_string(),
            })?;

        if search.selected_pharmacies.is_empty() {
            return Err(SchedulerError::NoPharmaciesSelected {
                id: search_id.to_string(),
            });
        }
        if search.status != SearchStatus::PaymentCompleted {
            warn!(search_id = %search_id, status = %search.status, "starting calls for search not in payment_completed");
        }

        self.searches
            .set_search_status(search_id, SearchStatus::CallingInProgress, now)
            .await?;

        let new_jobs = search
            .selected_pharmacies
            .iter()
            .map(|p| NewJob::for_pharmacy(&search, p, self.retry.max_attempts()))
            .collect();
        let jobs = self.jobs.create_jobs(new_jobs, now).await?;

        let delay_secs = self.window.delay_until_next_window(now)?;
        let scheduled_for = if delay_secs > 0 {
            Some(self.window.next_opening(now)?)
        } else {
            None
        };

        let results = join_all(
            jobs.iter()
                .map(|job| self.enqueue_initial(job, delay_secs, scheduled_for, now)),
        )
        .await;

        let mut report = StartReport {
            search_id: search_id.clone(),
            jobs_created: jobs.len(),
            enqueued: 0,
            failed: 0,
            skipped: 0,
            delay_secs,
            scheduled_for,
        };
        for r in results {
            match r {
                Enqueued::Yes => report.enqueued += 1,
                Enqueued::Failed => report.failed += 1,
                Enqueued::Skipped => report.skipped += 1,
            }
        }

        info!(
            search_id = %search_id,
            jobs = report.jobs_created,
            enqueued = report.enqueued,
            failed = report.failed,
            skipped = report.skipped,
            delay_secs,
            "calling started"
        );
        Ok(report)
    }

    async fn enqueue_initial(
        &self,
        job: &Job,
        delay_secs: u64,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Enqueued {
        if self.is_abandoned(job, now) {
            warn!(job_id = %job.id, attempt = job.attempt_count, "re-delivering abandoned job");
            return if self.dispatch(job, job.attempt_count, delay_secs, now).await {
                Enqueued::Yes
            } else {
                Enqueued::Failed
            };
        }
        if job.status != JobStatus::Pending || job.dispatcher_message_id.is_some() {
            return Enqueued::Skipped;
        }

        if let Some(at) = scheduled_for {
            let patch = JobPatch::status(JobStatus::RetryScheduled).with_scheduled_for(at);
            match self
                .jobs
                .transition_job(&job.id, &[JobStatus::Pending], Some(job.attempt_count), &patch, now)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => return Enqueued::Skipped,
                Err(e) => {
                    error!(job_id = %job.id, "failed to mark job scheduled: {e}");
                    return Enqueued::Failed;
                }
            }
        }

        if self.dispatch(job, job.attempt_count, delay_secs, now).await {
            Enqueued::Yes
        } else {
            Enqueued::Failed
        }
    }

    /// Hand `attempt` of `job` to the dispatcher. On success the message id is
    /// stored; on failure the job is downgraded to `failed`. Returns whether
    /// the delivery was scheduled.
    async fn dispatch(&self, job: &Job, attempt: u32, delay_secs: u64, now: DateTime<Utc>) -> bool {
        let task = JobTask {
            search_id: job.search_id.clone(),
            pharmacy_id: job.pharmacy_id.clone(),
            attempt,
        };
        match self.dispatcher.schedule(&task, delay_secs).await {
            Ok(message_id) => {
                let patch = JobPatch::default().with_message_id(message_id);
                if let Err(e) = self.jobs.update_job(&job.id, &patch, now).await {
                    warn!(job_id = %job.id, "could not store dispatcher message id: {e}");
                }
                true
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    dispatcher = self.dispatcher.name(),
                    attempt,
                    "enqueue failed: {e}"
                );
                let patch = JobPatch::status(JobStatus::Failed)
                    .with_completed_at(now)
                    .with_error(Some(ENQUEUE_FAILED_REASON.to_string()));
                if let Err(e) = self
                    .jobs
                    .transition_job(&job.id, &RUNNABLE, Some(attempt), &patch, now)
                    .await
                {
                    error!(job_id = %job.id, "could not mark job failed after enqueue error: {e}");
                }
                false
            }
        }
    }

    /// Handle one delivery. Duplicate and stale deliveries are skipped without
    /// side effects.
    pub async fn process_job(&self, task: &JobTask) -> Result<ProcessOutcome> {
        let now = self.clock.now();
        let Some(job) = self.jobs.get_job(&task.search_id, &task.pharmacy_id).await? else {
            error!(search_id = %task.search_id, pharmacy_id = %task.pharmacy_id, "job not found for delivery");
            return Err(SchedulerError::JobNotFound {
                id: format!("{}/{}", task.search_id, task.pharmacy_id),
            });
        };

        if job.is_terminal() {
            return Ok(self.skipped(&job, SkipReason::AlreadyTerminal));
        }
        if job.status == JobStatus::Processing {
            if task.attempt == job.attempt_count && self.is_abandoned(&job, now) {
                return self.resume_abandoned(&job, now).await;
            }
            return Ok(self.skipped(&job, SkipReason::InFlight));
        }
        if task.attempt != job.attempt_count {
            return Ok(self.skipped(&job, SkipReason::StaleAttempt));
        }
        let attempt = job.attempt_count;

        if !self
            .rate_guard
            .can_job_call_now(&job.pharmacy_id, &job.id, now)
            .await?
        {
            return self.fail_rate_limited(&job, attempt, now).await;
        }

        if !self.window.is_within(now) {
            let delay_secs = self.window.delay_until_next_window(now)?;
            let at = self.window.next_opening(now)?;
            let patch = JobPatch::status(JobStatus::RetryScheduled).with_scheduled_for(at);
            if self
                .jobs
                .transition_job(&job.id, &RUNNABLE, Some(attempt), &patch, now)
                .await?
                .is_none()
            {
                return Ok(self.skipped(&job, SkipReason::LostRace));
            }
            info!(job_id = %job.id, attempt, delay_secs, "outside calling window, rescheduled");
            return Ok(self.redeliver_at_opening(&job, attempt, delay_secs, at, now).await);
        }

        let claim = JobPatch::status(JobStatus::Processing).with_started_at(now);
        let Some(job) = self
            .jobs
            .transition_job(&job.id, &RUNNABLE, Some(attempt), &claim, now)
            .await?
        else {
            return Ok(self.skipped(&job, SkipReason::LostRace));
        };
        self.call_claimed(job, attempt, now).await
    }

    /// Take over a job whose claiming delivery never finished. The attempt is
    /// retried, not consumed: the abandoned call never reported an outcome.
    async fn resume_abandoned(&self, job: &Job, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        let attempt = job.attempt_count;
        let cutoff = now - self.processing_timeout;

        if !self.window.is_within(now) {
            let delay_secs = self.window.delay_until_next_window(now)?;
            let at = self.window.next_opening(now)?;
            let patch = JobPatch::status(JobStatus::RetryScheduled).with_scheduled_for(at);
            if self
                .jobs
                .reclaim_stale_job(&job.id, attempt, cutoff, &patch, now)
                .await?
                .is_none()
            {
                return Ok(self.skipped(job, SkipReason::LostRace));
            }
            warn!(job_id = %job.id, attempt, delay_secs, "abandoned job rescheduled to next window");
            return Ok(self.redeliver_at_opening(job, attempt, delay_secs, at, now).await);
        }

        let claim = JobPatch::status(JobStatus::Processing).with_started_at(now);
        let Some(job) = self
            .jobs
            .reclaim_stale_job(&job.id, attempt, cutoff, &claim, now)
            .await?
        else {
            return Ok(self.skipped(job, SkipReason::LostRace));
        };
        warn!(job_id = %job.id, attempt, started_at = ?job.started_at, "reclaimed abandoned job");
        self.call_claimed(job, attempt, now).await
    }

    async fn redeliver_at_opening(
        &self,
        job: &Job,
        attempt: u32,
        delay_secs: u64,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ProcessOutcome {
        if self.dispatch(job, attempt, delay_secs, now).await {
            ProcessOutcome::Rescheduled { scheduled_for: at }
        } else {
            ProcessOutcome::Failed {
                error: ENQUEUE_FAILED_REASON.to_string(),
            }
        }
    }

    /// Place the call for a job this delivery owns and record its fate.
    async fn call_claimed(&self, job: Job, attempt: u32, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        // Another job for the same pharmacy may have claimed the slot since
        // the check above.
        if !self
            .rate_guard
            .try_acquire(&job.pharmacy_id, &job.id, now)
            .await?
        {
            return self.fail_rate_limited(&job, attempt, now).await;
        }

        info!(job_id = %job.id, pharmacy = %job.pharmacy_name, attempt, "placing call");
        let outcome = self.run_call(&job, now).await;
        let ended = self.clock.now();

        if outcome.success {
            let patch = JobPatch::status(JobStatus::Completed)
                .with_completed_at(ended)
                .with_result(outcome.extracted.clone())
                .with_error(None);
            self.jobs.update_job(&job.id, &patch, ended).await?;
            info!(job_id = %job.id, attempt, "call completed");
            return Ok(ProcessOutcome::Completed);
        }

        let error = outcome.error_text();
        if !job.attempts_exhausted() {
            let next = attempt + 1;
            let delay_secs = self.retry.delay_for_attempt(next);
            let at = ended + Duration::seconds(delay_secs as i64);
            let patch = JobPatch::status(JobStatus::RetryScheduled)
                .with_attempt(next)
                .with_scheduled_for(at)
                .with_error(Some(error.clone()));
            self.jobs.update_job(&job.id, &patch, ended).await?;
            warn!(job_id = %job.id, attempt, next, delay_secs, %error, "call failed, retry scheduled");
            return Ok(if self.dispatch(&job, next, delay_secs, ended).await {
                ProcessOutcome::RetryScheduled {
                    attempt: next,
                    scheduled_for: at,
                }
            } else {
                ProcessOutcome::Failed {
                    error: ENQUEUE_FAILED_REASON.to_string(),
                }
            });
        }

        let reason = format!("{MAX_RETRIES_REASON}: {error}");
        let patch = JobPatch::status(JobStatus::Failed)
            .with_completed_at(ended)
            .with_error(Some(reason.clone()));
        self.jobs.update_job(&job.id, &patch, ended).await?;
        warn!(job_id = %job.id, attempt, %error, "call failed, attempts exhausted");
        Ok(ProcessOutcome::Failed { error: reason })
    }

    /// Record the call, run the executor, and fold panics into a failed outcome.
    async fn run_call(&self, job: &Job, now: DateTime<Utc>) -> CallOutcome {
        let mut record = CallRecord::initiated(job, self.executor.provider(), now);
        if let Err(e) = self.jobs.create_call_record(&record).await {
            error!(job_id = %job.id, "could not create call record: {e}");
        }

        let outcome = match AssertUnwindSafe(self.executor.execute(job))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(job_id = %job.id, "call executor panicked");
                CallOutcome::failed("call_failed")
            }
        };

        record.finish(&outcome, self.clock.now());
        if let Err(e) = self.jobs.finish_call_record(&record).await {
            error!(job_id = %job.id, "could not finish call record: {e}");
        }
        outcome
    }

    async fn fail_rate_limited(
        &self,
        job: &Job,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let patch = JobPatch::status(JobStatus::Failed)
            .with_completed_at(now)
            .with_error(Some(RATE_LIMITED_REASON.to_string()));
        let expected = [JobStatus::Pending, JobStatus::RetryScheduled, JobStatus::Processing];
        match self
            .jobs
            .transition_job(&job.id, &expected, Some(attempt), &patch, now)
            .await?
        {
            Some(_) => {
                warn!(job_id = %job.id, pharmacy_id = %job.pharmacy_id, "pharmacy called too recently");
                Ok(ProcessOutcome::RateLimited)
            }
            None => Ok(self.skipped(job, SkipReason::LostRace)),
        }
    }

    fn skipped(&self, job: &Job, reason: SkipReason) -> ProcessOutcome {
        info!(job_id = %job.id, status = %job.status, attempt = job.attempt_count, ?reason, "delivery skipped");
        ProcessOutcome::Skipped { reason }
    }

    /// Operator override: mark the search completed. Jobs and pending
    /// deliveries are left alone.
    pub async fn complete_search(&self, search_id: &SearchId) -> Result<()> {
        self.searches
            .set_search_status(search_id, SearchStatus::Completed, self.clock.now())
            .await?;
        info!(search_id = %search_id, "search marked completed");
        Ok(())
    }

    pub async fn jobs_for_search(&self, search_id: &SearchId) -> Result<Vec<Job>> {
        self.jobs.list_jobs_for_search(search_id).await
    }

    pub async fn metrics(&self, search_id: &SearchId) -> Result<JobMetrics> {
        let jobs = self.jobs.list_jobs_for_search(search_id).await?;
        let mut metrics = JobMetrics::from_jobs(&jobs);
        for job in &jobs {
            metrics.total_calls += self.jobs.list_call_records(&job.id).await?.len();
        }
        Ok(metrics)
    }

    pub async fn call_records(&self, job_id: &JobId) -> Result<Vec<CallRecord>> {
        self.jobs.list_call_records(job_id).await
    }
}
