use std::path::Path;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pharmcall_core::{JobId, PharmacyId, SearchId, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::rate::{RateMarker, RateMarkerStore};
use crate::store::{JobStore, SearchStore};
use crate::types::{
    CallRecord, ExtractedData, Job, JobPatch, JobStatus, NewJob, Search, SearchStatus,
};

const JOB_COLUMNS: &str = "id, search_id, pharmacy_id, pharmacy_name, pharmacy_phone,
    pharmacy_address, medication_name, dosage, user_id, status, attempt_count, max_attempts,
    scheduled_for, started_at, completed_at, error_message, result, dispatcher_message_id,
    created_at, updated_at";

const CALL_COLUMNS: &str = "id, job_id, attempt, provider, status, duration_secs, transcript,
    result, confidence, provider_call_id, error_message, created_at, ended_at";

/// SQLite-backed implementation of every scheduler store.
///
/// A single connection behind a mutex; the lock is never held across an
/// `.await`, so the async trait methods run the statement inline.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        info!(path = %path.as_ref().display(), "opened scheduler database");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| SchedulerError::Poisoned)?;
        f(&mut conn)
    }
}

// --- row codecs ------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_result(s: Option<String>) -> Result<Option<ExtractedData>> {
    Ok(s.as_deref().map(serde_json::from_str).transpose()?)
}

fn encode_result(result: &Option<ExtractedData>) -> Result<Option<String>> {
    Ok(result.as_ref().map(serde_json::to_string).transpose()?)
}

struct JobRow {
    id: String,
    search_id: String,
    pharmacy_id: String,
    pharmacy_name: String,
    pharmacy_phone: String,
    pharmacy_address: String,
    medication_name: String,
    dosage: Option<String>,
    user_id: Option<String>,
    status: String,
    attempt_count: u32,
    max_attempts: u32,
    scheduled_for: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    result: Option<String>,
    dispatcher_message_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            search_id: row.get("search_id")?,
            pharmacy_id: row.get("pharmacy_id")?,
            pharmacy_name: row.get("pharmacy_name")?,
            pharmacy_phone: row.get("pharmacy_phone")?,
            pharmacy_address: row.get("pharmacy_address")?,
            medication_name: row.get("medication_name")?,
            dosage: row.get("dosage")?,
            user_id: row.get("user_id")?,
            status: row.get("status")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            scheduled_for: row.get("scheduled_for")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_message: row.get("error_message")?,
            result: row.get("result")?,
            dispatcher_message_id: row.get("dispatcher_message_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status: JobStatus = self.status.parse().map_err(SchedulerError::Corrupt)?;
        Ok(Job {
            id: JobId::from(self.id),
            search_id: SearchId::from(self.search_id),
            pharmacy_id: PharmacyId::from(self.pharmacy_id),
            pharmacy_name: self.pharmacy_name,
            pharmacy_phone: self.pharmacy_phone,
            pharmacy_address: self.pharmacy_address,
            medication_name: self.medication_name,
            dosage: self.dosage,
            user_id: self.user_id.map(UserId::from),
            status,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            scheduled_for: parse_opt_ts(self.scheduled_for)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            error_message: self.error_message,
            result: parse_result(self.result)?,
            dispatcher_message_id: self.dispatcher_message_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct CallRow {
    id: String,
    job_id: String,
    attempt: u32,
    provider: String,
    status: String,
    duration_secs: u32,
    transcript: Option<String>,
    result: Option<String>,
    confidence: Option<f64>,
    provider_call_id: Option<String>,
    error_message: Option<String>,
    created_at: String,
    ended_at: Option<String>,
}

impl CallRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            attempt: row.get("attempt")?,
            provider: row.get("provider")?,
            status: row.get("status")?,
            duration_secs: row.get("duration_secs")?,
            transcript: row.get("transcript")?,
            result: row.get("result")?,
            confidence: row.get("confidence")?,
            provider_call_id: row.get("provider_call_id")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            ended_at: row.get("ended_at")?,
        })
    }

    fn into_record(self) -> Result<CallRecord> {
        Ok(CallRecord {
            id: self.id,
            job_id: JobId::from(self.job_id),
            attempt: self.attempt,
            provider: self.provider.parse().map_err(SchedulerError::Corrupt)?,
            status: self.status.parse().map_err(SchedulerError::Corrupt)?,
            duration_secs: self.duration_secs,
            transcript: self.transcript,
            result: parse_result(self.result)?,
            confidence: self.confidence,
            provider_call_id: self.provider_call_id,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
            ended_at: parse_opt_ts(self.ended_at)?,
        })
    }
}

fn load_job_by_id(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?1");
    conn.query_row(&sql, [id.as_str()], JobRow::from_row)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

fn load_job(conn: &Connection, search: &SearchId, pharmacy: &PharmacyId) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE search_id = ?1 AND pharmacy_id = ?2");
    conn.query_row(&sql, [search.as_str(), pharmacy.as_str()], JobRow::from_row)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

/// Persist the mutable columns of `job`.
fn write_job(tx: &Transaction<'_>, job: &Job) -> Result<()> {
    tx.execute(
        "UPDATE queue_jobs SET status = ?2, attempt_count = ?3, scheduled_for = ?4,
            started_at = ?5, completed_at = ?6, error_message = ?7, result = ?8,
            dispatcher_message_id = ?9, updated_at = ?10
         WHERE id = ?1",
        params![
            job.id.as_str(),
            job.status.as_str(),
            job.attempt_count,
            opt_ts(job.scheduled_for),
            opt_ts(job.started_at),
            opt_ts(job.completed_at),
            job.error_message,
            encode_result(&job.result)?,
            job.dispatcher_message_id,
            ts(job.updated_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_jobs(&self, jobs: Vec<NewJob>, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut stored = Vec::with_capacity(jobs.len());
            for new_job in jobs {
                let job = new_job.into_job(now);
                let inserted = tx.execute(
                    "INSERT INTO queue_jobs
                     (id, search_id, pharmacy_id, pharmacy_name, pharmacy_phone, pharmacy_address,
                      medication_name, dosage, user_id, status, attempt_count, max_attempts,
                      created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)
                     ON CONFLICT (search_id, pharmacy_id) DO NOTHING",
                    params![
                        job.id.as_str(),
                        job.search_id.as_str(),
                        job.pharmacy_id.as_str(),
                        job.pharmacy_name,
                        job.pharmacy_phone,
                        job.pharmacy_address,
                        job.medication_name,
                        job.dosage,
                        job.user_id.as_ref().map(|u| u.as_str()),
                        job.status.as_str(),
                        job.attempt_count,
                        job.max_attempts,
                        ts(now),
                    ],
                )?;
                if inserted == 0 {
                    debug!(search_id = %job.search_id, pharmacy_id = %job.pharmacy_id, "job already exists");
                }
                let row = load_job(&tx, &job.search_id, &job.pharmacy_id)?.ok_or_else(|| {
                    SchedulerError::Corrupt(format!("job for {} vanished after insert", job.pharmacy_id))
                })?;
                stored.push(row);
            }
            tx.commit()?;
            Ok(stored)
        })
    }

    async fn get_job(&self, search: &SearchId, pharmacy: &PharmacyId) -> Result<Option<Job>> {
        self.with_conn(|conn| load_job(conn, search, pharmacy))
    }

    async fn update_job(&self, id: &JobId, patch: &JobPatch, now: DateTime<Utc>) -> Result<Job> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut job = load_job_by_id(&tx, id)?.ok_or_else(|| SchedulerError::JobNotFound {
                id: id.to_string(),
            })?;
            patch.apply(&mut job, now);
            write_job(&tx, &job)?;
            tx.commit()?;
            Ok(job)
        })
    }

    async fn transition_job(
        &self,
        id: &JobId,
        expected: &[JobStatus],
        expected_attempt: Option<u32>,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut job) = load_job_by_id(&tx, id)? else {
                return Err(SchedulerError::JobNotFound { id: id.to_string() });
            };
            let status_ok = expected.contains(&job.status);
            let attempt_ok = expected_attempt.map_or(true, |a| a == job.attempt_count);
            if !(status_ok && attempt_ok) {
                debug!(job_id = %id, status = %job.status, attempt = job.attempt_count, "transition rejected");
                return Ok(None);
            }
            patch.apply(&mut job, now);
            write_job(&tx, &job)?;
            tx.commit()?;
            Ok(Some(job))
        })
    }

    async fn reclaim_stale_job(
        &self,
        id: &JobId,
        attempt: u32,
        started_before: DateTime<Utc>,
        patch: &JobPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut job) = load_job_by_id(&tx, id)? else {
                return Err(SchedulerError::JobNotFound { id: id.to_string() });
            };
            let stale = job.status == JobStatus::Processing
                && job.attempt_count == attempt
                && job.started_at.map_or(true, |at| at <= started_before);
            if !stale {
                debug!(job_id = %id, status = %job.status, attempt = job.attempt_count, "reclaim rejected");
                return Ok(None);
            }
            patch.apply(&mut job, now);
            write_job(&tx, &job)?;
            tx.commit()?;
            Ok(Some(job))
        })
    }

    async fn list_jobs_for_search(&self, search: &SearchId) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE search_id = ?1 ORDER BY created_at, pharmacy_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([search.as_str()], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(JobRow::into_job).collect()
        })
    }

    async fn create_call_record(&self, record: &CallRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO calls ({CALL_COLUMNS})
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
                ),
                params![
                    record.id,
                    record.job_id.as_str(),
                    record.attempt,
                    record.provider.to_string(),
                    record.status.to_string(),
                    record.duration_secs,
                    record.transcript,
                    encode_result(&record.result)?,
                    record.confidence,
                    record.provider_call_id,
                    record.error_message,
                    ts(record.created_at),
                    opt_ts(record.ended_at),
                ],
            )?;
            Ok(())
        })
    }

    async fn finish_call_record(&self, record: &CallRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE calls SET status = ?2, duration_secs = ?3, transcript = ?4, result = ?5,
                    confidence = ?6, provider_call_id = ?7, error_message = ?8, ended_at = ?9
                 WHERE id = ?1",
                params![
                    record.id,
                    record.status.to_string(),
                    record.duration_secs,
                    record.transcript,
                    encode_result(&record.result)?,
                    record.confidence,
                    record.provider_call_id,
                    record.error_message,
                    opt_ts(record.ended_at),
                ],
            )?;
            Ok(())
        })
    }

    async fn list_call_records(&self, job: &JobId) -> Result<Vec<CallRecord>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE job_id = ?1 ORDER BY attempt, created_at");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([job.as_str()], CallRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(CallRow::into_record).collect()
        })
    }
}

#[async_trait]
impl SearchStore for SqliteStore {
    async fn create_search(&self, search: &Search) -> Result<()> {
        let pharmacies = serde_json::to_string(&search.selected_pharmacies)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO searches
                 (id, user_id, medication_name, dosage, status, selected_pharmacies, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    search.id.as_str(),
                    search.user_id.as_ref().map(|u| u.as_str()),
                    search.medication_name,
                    search.dosage,
                    search.status.to_string(),
                    pharmacies,
                    ts(search.created_at),
                    ts(search.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    async fn get_search(&self, id: &SearchId) -> Result<Option<Search>> {
        type SearchRow = (
            String,
            Option<String>,
            String,
            Option<String>,
            String,
            String,
            String,
            String,
        );
        let row: Option<SearchRow> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, user_id, medication_name, dosage, status, selected_pharmacies,
                            created_at, updated_at
                     FROM searches WHERE id = ?1",
                    [id.as_str()],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((id, user_id, medication_name, dosage, status, pharmacies, created, updated)) = row
        else {
            return Ok(None);
        };
        Ok(Some(Search {
            id: SearchId::from(id),
            user_id: user_id.map(UserId::from),
            medication_name,
            dosage,
            status: status.parse().map_err(SchedulerError::Corrupt)?,
            selected_pharmacies: serde_json::from_str(&pharmacies)?,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        }))
    }

    async fn set_search_status(
        &self,
        id: &SearchId,
        status: SearchStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE searches SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), status.to_string(), ts(now)],
            )?;
            if n == 0 {
                return Err(SchedulerError::SearchNotFound { id: id.to_string() });
            }
            Ok(())
        })
    }
}

#[async_trait]
impl RateMarkerStore for SqliteStore {
    async fn last_called(&self, pharmacy: &PharmacyId) -> Result<Option<RateMarker>> {
        let raw: Option<(String, Option<String>)> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_called_at, last_job_id FROM pharmacy_call_markers
                     WHERE pharmacy_id = ?1",
                    [pharmacy.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;
        raw.map(|(at, job)| {
            Ok(RateMarker {
                last_called_at: parse_ts(&at)?,
                job_id: job.map(JobId::from),
            })
        })
        .transpose()
    }

    async fn set_last_called(
        &self,
        pharmacy: &PharmacyId,
        at: DateTime<Utc>,
        job: Option<&JobId>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pharmacy_call_markers (pharmacy_id, last_called_at, last_job_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (pharmacy_id) DO UPDATE
                 SET last_called_at = excluded.last_called_at, last_job_id = excluded.last_job_id",
                params![pharmacy.as_str(), ts(at), job.map(|j| j.as_str())],
            )?;
            Ok(())
        })
    }

    async fn compare_and_set_last_called(
        &self,
        pharmacy: &PharmacyId,
        at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        job: &JobId,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT INTO pharmacy_call_markers (pharmacy_id, last_called_at, last_job_id)
                 VALUES (?1, ?2, ?4)
                 ON CONFLICT (pharmacy_id) DO UPDATE
                 SET last_called_at = excluded.last_called_at, last_job_id = excluded.last_job_id
                 WHERE pharmacy_call_markers.last_called_at <= ?3
                    OR pharmacy_call_markers.last_job_id = ?4",
                params![pharmacy.as_str(), ts(at), ts(cutoff), job.as_str()],
            )?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallProvider, CallStatus, SelectedPharmacy};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap()
    }

    fn search() -> Search {
        Search {
            id: SearchId::from("s1"),
            user_id: Some(UserId::from("u1")),
            medication_name: "Amoxicillin".into(),
            dosage: Some("500mg".into()),
            status: SearchStatus::PaymentCompleted,
            selected_pharmacies: vec![
                SelectedPharmacy {
                    id: PharmacyId::from("p1"),
                    name: "Corner Drug".into(),
                    phone: "555-0100".into(),
                    address: "1 Main St".into(),
                },
                SelectedPharmacy {
                    id: PharmacyId::from("p2"),
                    name: "Uptown Rx".into(),
                    phone: "555-0101".into(),
                    address: "9 Elm St".into(),
                },
            ],
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn new_jobs(s: &Search) -> Vec<NewJob> {
        s.selected_pharmacies
            .iter()
            .map(|p| NewJob::for_pharmacy(s, p, 3))
            .collect()
    }

    #[tokio::test]
    async fn create_jobs_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = search();
        let first = store.create_jobs(new_jobs(&s), t0()).await.unwrap();
        let second = store
            .create_jobs(new_jobs(&s), t0() + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[1].id, second[1].id);
        assert_eq!(store.list_jobs_for_search(&s.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn job_round_trips_through_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = search();
        let jobs = store.create_jobs(new_jobs(&s), t0()).await.unwrap();
        let patch = JobPatch::status(JobStatus::Completed)
            .with_completed_at(t0())
            .with_result(Some(ExtractedData {
                availability: Some(true),
                price: Some(12.5),
                notes: "in stock".into(),
            }));
        store.update_job(&jobs[0].id, &patch, t0()).await.unwrap();

        let loaded = store
            .get_job(&s.id, &PharmacyId::from("p1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.completed_at, Some(t0()));
        assert_eq!(loaded.result.unwrap().price, Some(12.5));
        assert_eq!(loaded.user_id, Some(UserId::from("u1")));
    }

    #[tokio::test]
    async fn transition_requires_expected_status_and_attempt() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = search();
        let jobs = store.create_jobs(new_jobs(&s), t0()).await.unwrap();
        let id = &jobs[0].id;
        let to_processing = JobPatch::status(JobStatus::Processing).with_started_at(t0());

        let won = store
            .transition_job(id, &[JobStatus::Pending], Some(1), &to_processing, t0())
            .await
            .unwrap();
        assert!(won.is_some());

        let lost = store
            .transition_job(id, &[JobStatus::Pending], Some(1), &to_processing, t0())
            .await
            .unwrap();
        assert!(lost.is_none());

        let stale = store
            .transition_job(id, &[JobStatus::Processing], Some(2), &to_processing, t0())
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn reclaim_only_takes_processing_jobs_started_before_cutoff() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = search();
        let jobs = store.create_jobs(new_jobs(&s), t0()).await.unwrap();
        let id = &jobs[0].id;
        let cutoff = t0() + Duration::minutes(10);
        let reclaim = JobPatch::status(JobStatus::Processing).with_started_at(cutoff);

        // pending is not abandoned
        let pending = store
            .reclaim_stale_job(id, 1, cutoff, &reclaim, cutoff)
            .await
            .unwrap();
        assert!(pending.is_none());

        let to_processing = JobPatch::status(JobStatus::Processing).with_started_at(t0());
        store
            .transition_job(id, &[JobStatus::Pending], Some(1), &to_processing, t0())
            .await
            .unwrap()
            .unwrap();

        let fresh = store
            .reclaim_stale_job(id, 1, t0() - Duration::seconds(1), &reclaim, cutoff)
            .await
            .unwrap();
        assert!(fresh.is_none());
        let wrong_attempt = store
            .reclaim_stale_job(id, 2, cutoff, &reclaim, cutoff)
            .await
            .unwrap();
        assert!(wrong_attempt.is_none());

        let reclaimed = store
            .reclaim_stale_job(id, 1, cutoff, &reclaim, cutoff)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.started_at, Some(cutoff));

        // the refreshed start time makes a second reclaim at the same cutoff lose
        let again = store
            .reclaim_stale_job(id, 1, cutoff - Duration::seconds(1), &reclaim, cutoff)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update_job(&JobId::from("nope".to_string()), &JobPatch::default(), t0())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn search_status_updates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = search();
        store.create_search(&s).await.unwrap();
        store
            .set_search_status(&s.id, SearchStatus::CallingInProgress, t0())
            .await
            .unwrap();

        let loaded = store.get_search(&s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SearchStatus::CallingInProgress);
        assert_eq!(loaded.selected_pharmacies.len(), 2);

        let err = store
            .set_search_status(&SearchId::from("missing"), SearchStatus::Completed, t0())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SEARCH_NOT_FOUND");
    }

    #[tokio::test]
    async fn call_records_are_listed_per_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s = search();
        let jobs = store.create_jobs(new_jobs(&s), t0()).await.unwrap();

        let mut record = CallRecord::initiated(&jobs[0], CallProvider::Simulated, t0());
        store.create_call_record(&record).await.unwrap();
        record.status = CallStatus::Failed;
        record.error_message = Some("busy".into());
        record.ended_at = Some(t0() + Duration::seconds(40));
        store.finish_call_record(&record).await.unwrap();

        let records = store.list_call_records(&jobs[0].id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CallStatus::Failed);
        assert_eq!(records[0].error_message.as_deref(), Some("busy"));
        assert!(store.list_call_records(&jobs[1].id).await.unwrap().is_empty());
    }
}
