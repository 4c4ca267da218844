use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pharmcall_core::{JobId, PharmacyId, SearchId};

use crate::error::Result;
use crate::types::{CallRecord, Job, JobPatch, JobStatus, NewJob, Search, SearchStatus};

/// Persistence for jobs and their call records.
///
/// Implementations must make `create_jobs` idempotent on
/// `(search_id, pharmacy_id)` and `transition_job` atomic.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one job per entry, skipping pairs that already exist, and return
    /// the stored rows (new and pre-existing) in input order.
    async fn create_jobs(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn get_job(&self, search: &SearchId, pharmacy: &PharmacyId) -> Result<Option<Job>>;

    /// Unconditional update. Errors with `JobNotFound` if the id is unknown.
    async fn update_job(&self, id: &JobId, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job>;

    /// Apply `patch` only if the job is currently in one of `expected` and,
    /// when given, at attempt `expected_attempt`. `None` means another writer
    /// got there first.
    async fn transition_job(
        &self,
        id: &JobId,
        expected: &[JobStatus],
        expected_attempt: Option<u32>,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Apply `patch` to a job left in `processing` at `attempt` whose
    /// `started_at` is at or before `started_before`. `None` if the job is
    /// not abandoned, or another delivery reclaimed it first.
    async fn reclaim_stale_job(
        &self,
        id: &JobId,
        attempt: u32,
        started_before: DateTime<Utc>,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    async fn list_jobs_for_search(&self, search: &SearchId) -> Result<Vec<Job>>;

    async fn create_call_record(&self, record: &CallRecord) -> Result<()>;

    async fn finish_call_record(&self, record: &CallRecord) -> Result<()>;

    async fn list_call_records(&self, job: &JobId) -> Result<Vec<CallRecord>>;
}

/// The slice of search persistence the scheduler needs.
#[async_trait]
pub trait SearchStore: Send + Sync {
    async fn create_search(&self, search: &Search) -> Result<()>;

    async fn get_search(&self, id: &SearchId) -> Result<Option<Search>>;

    async fn set_search_status(
        &self,
        id: &SearchId,
        status: SearchStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
