use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pharmcall_core::{PharmacyId, SearchId, UserId};
use pharmcall_scheduler::types::{ENQUEUE_FAILED_REASON, RATE_LIMITED_REASON};
use pharmcall_scheduler::{
    CallExecutor, CallOutcome, CallProvider, CallScheduler, CallingWindow, Clock, DispatchError,
    ExtractedData, FixedClock, Job, JobPatch, JobStatus, JobStore, JobTask, ProcessOutcome, RateGuard,
    RetryPolicy, Search, SearchStatus, SearchStore, SelectedPharmacy, SkipReason, SqliteStore,
    TaskDispatcher,
};
use tokio::sync::Notify;

// --- test doubles ----------------------------------------------------------

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(JobTask, u64)>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    fn take(&self) -> Vec<(JobTask, u64)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn schedule(&self, task: &JobTask, delay_secs: u64) -> Result<String, DispatchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((task.clone(), delay_secs));
        Ok(format!("msg-{}", sent.len()))
    }
}

fn success() -> CallOutcome {
    CallOutcome {
        success: true,
        duration_secs: 45,
        transcript: Some("Yes, we have it in stock for $12.00".into()),
        extracted: Some(ExtractedData {
            availability: Some(true),
            price: Some(12.0),
            notes: "in stock".into(),
        }),
        confidence: Some(0.9),
        provider_call_id: Some("call-1".into()),
        error: None,
    }
}

/// Replays queued outcomes, then falls back to `default`. Remembers the job
/// state it was handed on each call.
struct ScriptedExecutor {
    script: Mutex<VecDeque<CallOutcome>>,
    default: CallOutcome,
    seen: Mutex<Vec<(JobStatus, u32)>>,
}

impl ScriptedExecutor {
    fn always(outcome: CallOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: outcome,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl CallExecutor for ScriptedExecutor {
    fn provider(&self) -> CallProvider {
        CallProvider::Simulated
    }

    async fn execute(&self, job: &Job) -> CallOutcome {
        self.seen
            .lock()
            .unwrap()
            .push((job.status, job.attempt_count));
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.default.clone())
    }
}

/// Blocks inside the call until released.
struct GatedExecutor {
    started: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl CallExecutor for GatedExecutor {
    fn provider(&self) -> CallProvider {
        CallProvider::Simulated
    }

    async fn execute(&self, _job: &Job) -> CallOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        success()
    }
}

struct PanickingExecutor;

#[async_trait]
impl CallExecutor for PanickingExecutor {
    fn provider(&self) -> CallProvider {
        CallProvider::Simulated
    }

    async fn execute(&self, _job: &Job) -> CallOutcome {
        panic!("provider client blew up");
    }
}

// --- harness ---------------------------------------------------------------

struct Harness {
    store: Arc<SqliteStore>,
    clock: Arc<FixedClock>,
    dispatcher: Arc<RecordingDispatcher>,
    scheduler: Arc<CallScheduler>,
}

/// Wednesday 2024-01-03 10:00 America/New_York.
fn weekday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap()
}

fn harness(executor: Arc<dyn CallExecutor>, now: DateTime<Utc>) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(FixedClock::new(now));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let scheduler = CallScheduler::new(
        store.clone(),
        store.clone(),
        RateGuard::new(store.clone(), 3600),
        CallingWindow::default(),
        RetryPolicy::default(),
        executor,
        dispatcher.clone(),
    )
    .with_clock(clock.clone());
    Harness {
        store,
        clock,
        dispatcher,
        scheduler: Arc::new(scheduler),
    }
}

async fn seed_search(h: &Harness, id: &str, pharmacies: &[&str]) -> SearchId {
    let now = h.clock.now();
    let search = Search {
        id: SearchId::from(id),
        user_id: Some(UserId::from("user-1")),
        medication_name: "Adderall".into(),
        dosage: Some("20mg".into()),
        status: SearchStatus::PaymentCompleted,
        selected_pharmacies: pharmacies
            .iter()
            .map(|p| SelectedPharmacy {
                id: PharmacyId::from(*p),
                name: format!("Pharmacy {p}"),
                phone: "(555) 010-0000".into(),
                address: "1 Main St".into(),
            })
            .collect(),
        created_at: now,
        updated_at: now,
    };
    h.store.create_search(&search).await.unwrap();
    search.id
}

async fn job(h: &Harness, search: &SearchId, pharmacy: &str) -> Job {
    h.store
        .get_job(search, &PharmacyId::from(pharmacy))
        .await
        .unwrap()
        .unwrap()
}

fn task(search: &SearchId, pharmacy: &str, attempt: u32) -> JobTask {
    JobTask {
        search_id: search.clone(),
        pharmacy_id: PharmacyId::from(pharmacy),
        attempt,
    }
}

// --- scenarios -------------------------------------------------------------

#[tokio::test]
async fn all_calls_succeed_inside_business_hours() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec.clone(), weekday_morning());
    let search = seed_search(&h, "s-a", &["p1", "p2", "p3"]).await;

    let report = h.scheduler.start_calling(&search).await.unwrap();
    assert_eq!(report.jobs_created, 3);
    assert_eq!(report.enqueued, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.delay_secs, 0);
    assert!(report.scheduled_for.is_none());

    let deliveries = h.dispatcher.take();
    assert_eq!(deliveries.len(), 3);
    for (t, delay) in &deliveries {
        assert_eq!(*delay, 0);
        assert_eq!(t.attempt, 1);
        let outcome = h.scheduler.process_job(t).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);
    }

    for p in ["p1", "p2", "p3"] {
        let j = job(&h, &search, p).await;
        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.result.as_ref().and_then(|r| r.availability), Some(true));
        assert!(j.completed_at.is_some());
        assert!(j.scheduled_for.is_none());
    }
    assert_eq!(exec.calls(), 3);

    let s = h.store.get_search(&search).await.unwrap().unwrap();
    assert_eq!(s.status, SearchStatus::CallingInProgress);

    h.scheduler.complete_search(&search).await.unwrap();
    let s = h.store.get_search(&search).await.unwrap().unwrap();
    assert_eq!(s.status, SearchStatus::Completed);

    let metrics = h.scheduler.metrics(&search).await.unwrap();
    assert_eq!(metrics.completed, 3);
    assert_eq!(metrics.total_calls, 3);
    assert_eq!(metrics.success_rate, 1.0);
}

#[tokio::test]
async fn start_outside_hours_defers_every_job_to_next_opening() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    // Saturday 2024-01-06 07:00 EST
    let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
    let monday_open = Utc.with_ymd_and_hms(2024, 1, 8, 14, 0, 0).unwrap();
    let h = harness(exec.clone(), saturday);
    let search = seed_search(&h, "s-b", &["p1", "p2", "p3"]).await;

    let report = h.scheduler.start_calling(&search).await.unwrap();
    assert_eq!(report.enqueued, 3);
    assert_eq!(report.delay_secs, 180_000);
    assert_eq!(report.scheduled_for, Some(monday_open));

    for p in ["p1", "p2", "p3"] {
        let j = job(&h, &search, p).await;
        assert_eq!(j.status, JobStatus::RetryScheduled);
        assert_eq!(j.scheduled_for, Some(monday_open));
        assert_eq!(j.attempt_count, 1);
    }
    let deliveries = h.dispatcher.take();
    assert!(deliveries.iter().all(|(_, d)| *d == 180_000));
    assert_eq!(exec.calls(), 0);

    // An early delivery is pushed back again without calling.
    let early = h.scheduler.process_job(&deliveries[0].0).await.unwrap();
    assert_eq!(
        early,
        ProcessOutcome::Rescheduled {
            scheduled_for: monday_open
        }
    );
    assert_eq!(exec.calls(), 0);
    assert_eq!(h.dispatcher.take().len(), 1);

    h.clock.set(monday_open);
    for (t, _) in &deliveries {
        assert_eq!(
            h.scheduler.process_job(t).await.unwrap(),
            ProcessOutcome::Completed
        );
    }
    assert_eq!(exec.calls(), 3);
}

#[tokio::test]
async fn three_failures_exhaust_the_job() {
    let exec = Arc::new(ScriptedExecutor::always(CallOutcome::failed("no_answer")));
    let h = harness(exec.clone(), weekday_morning());
    let search = seed_search(&h, "s-c", &["p1"]).await;
    h.scheduler.start_calling(&search).await.unwrap();
    h.dispatcher.take();

    let first = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    let retry_at = weekday_morning() + Duration::seconds(1800);
    assert_eq!(
        first,
        ProcessOutcome::RetryScheduled {
            attempt: 2,
            scheduled_for: retry_at
        }
    );
    let j = job(&h, &search, "p1").await;
    assert_eq!(j.status, JobStatus::RetryScheduled);
    assert_eq!(j.attempt_count, 2);
    assert_eq!(j.scheduled_for, Some(retry_at));
    assert_eq!(j.error_message.as_deref(), Some("no_answer"));
    assert!(j.completed_at.is_none());
    assert_eq!(h.dispatcher.take(), vec![(task(&search, "p1", 2), 1800)]);

    // A late duplicate of attempt 1 is stale.
    assert_eq!(
        h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap(),
        ProcessOutcome::Skipped {
            reason: SkipReason::StaleAttempt
        }
    );

    h.clock.advance(Duration::seconds(1800));
    let second = h.scheduler.process_job(&task(&search, "p1", 2)).await.unwrap();
    assert!(matches!(
        second,
        ProcessOutcome::RetryScheduled { attempt: 3, .. }
    ));
    assert_eq!(h.dispatcher.take(), vec![(task(&search, "p1", 3), 7200)]);
    assert!(job(&h, &search, "p1").await.completed_at.is_none());

    h.clock.advance(Duration::seconds(7200));
    let third = h.scheduler.process_job(&task(&search, "p1", 3)).await.unwrap();
    assert_eq!(
        third,
        ProcessOutcome::Failed {
            error: "Max retries exceeded: no_answer".into()
        }
    );

    let j = job(&h, &search, "p1").await;
    assert_eq!(j.status, JobStatus::Failed);
    assert_eq!(j.attempt_count, 3);
    assert!(j.completed_at.is_some());
    assert!(j.scheduled_for.is_none());
    assert!(j.error_message.is_some());

    let seen = exec.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (JobStatus::Processing, 1),
            (JobStatus::Processing, 2),
            (JobStatus::Processing, 3)
        ]
    );
    assert_eq!(h.scheduler.call_records(&j.id).await.unwrap().len(), 3);

    // Redelivery after exhaustion changes nothing.
    assert_eq!(
        h.scheduler.process_job(&task(&search, "p1", 3)).await.unwrap(),
        ProcessOutcome::Skipped {
            reason: SkipReason::AlreadyTerminal
        }
    );
    let after = job(&h, &search, "p1").await;
    assert_eq!(after.updated_at, j.updated_at);
    assert_eq!(h.scheduler.call_records(&j.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn shared_pharmacy_across_searches_is_rate_limited() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec.clone(), weekday_morning());
    let first = seed_search(&h, "s-d1", &["shared"]).await;
    let second = seed_search(&h, "s-d2", &["shared"]).await;
    h.scheduler.start_calling(&first).await.unwrap();
    h.scheduler.start_calling(&second).await.unwrap();

    assert_eq!(
        h.scheduler.process_job(&task(&first, "shared", 1)).await.unwrap(),
        ProcessOutcome::Completed
    );

    h.clock.advance(Duration::minutes(10));
    assert_eq!(
        h.scheduler.process_job(&task(&second, "shared", 1)).await.unwrap(),
        ProcessOutcome::RateLimited
    );

    let j = job(&h, &second, "shared").await;
    assert_eq!(j.status, JobStatus::Failed);
    assert_eq!(j.error_message.as_deref(), Some(RATE_LIMITED_REASON));
    assert_eq!(j.attempt_count, 1);
    assert_eq!(exec.calls(), 1);
    assert!(h.scheduler.call_records(&j.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_delivery_while_processing_places_one_call() {
    let exec = Arc::new(GatedExecutor {
        started: Notify::new(),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let h = harness(exec.clone(), weekday_morning());
    let search = seed_search(&h, "s-e", &["p1"]).await;
    h.scheduler.start_calling(&search).await.unwrap();

    let scheduler = h.scheduler.clone();
    let t = task(&search, "p1", 1);
    let first = tokio::spawn(async move { scheduler.process_job(&t).await });
    exec.started.notified().await;

    let dup = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    assert_eq!(
        dup,
        ProcessOutcome::Skipped {
            reason: SkipReason::InFlight
        }
    );

    exec.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), ProcessOutcome::Completed);

    let j = job(&h, &search, "p1").await;
    assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.scheduler.call_records(&j.id).await.unwrap().len(), 1);
}

/// Leave the job claimed at `attempt` as if its delivery died mid-call.
async fn strand_in_processing(h: &Harness, search: &SearchId, pharmacy: &str) -> Job {
    let j = job(h, search, pharmacy).await;
    let now = h.clock.now();
    let claim = JobPatch::status(JobStatus::Processing).with_started_at(now);
    h.store
        .transition_job(&j.id, &[j.status], Some(j.attempt_count), &claim, now)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn redelivery_reclaims_job_stuck_in_processing() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec.clone(), weekday_morning());
    let search = seed_search(&h, "s-stuck", &["p1"]).await;
    h.scheduler.start_calling(&search).await.unwrap();
    h.dispatcher.take();
    strand_in_processing(&h, &search, "p1").await;

    // a redelivery right away still defers to the live claim
    let early = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    assert_eq!(
        early,
        ProcessOutcome::Skipped {
            reason: SkipReason::InFlight
        }
    );
    assert_eq!(exec.calls(), 0);

    // 13:00 in New York, well past the processing timeout
    h.clock.advance(Duration::hours(3));
    let outcome = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Completed);

    let j = job(&h, &search, "p1").await;
    assert_eq!(j.status, JobStatus::Completed);
    assert_eq!(j.attempt_count, 1);
    assert_eq!(exec.calls(), 1);
    assert_eq!(h.scheduler.call_records(&j.id).await.unwrap().len(), 1);

    // the original delivery arriving late changes nothing
    let late = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    assert_eq!(
        late,
        ProcessOutcome::Skipped {
            reason: SkipReason::AlreadyTerminal
        }
    );
}

#[tokio::test]
async fn stuck_job_found_after_close_waits_for_next_opening() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec.clone(), weekday_morning());
    let search = seed_search(&h, "s-stuck-late", &["p1"]).await;
    h.scheduler.start_calling(&search).await.unwrap();
    h.dispatcher.take();
    strand_in_processing(&h, &search, "p1").await;

    // Wednesday 20:00 in New York
    h.clock.advance(Duration::hours(10));
    let outcome = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    let opening = Utc.with_ymd_and_hms(2024, 1, 4, 14, 0, 0).unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Rescheduled {
            scheduled_for: opening
        }
    );
    assert_eq!(exec.calls(), 0);

    let j = job(&h, &search, "p1").await;
    assert_eq!(j.status, JobStatus::RetryScheduled);
    assert_eq!(j.scheduled_for, Some(opening));
    let sent = h.dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.attempt, 1);
    assert_eq!(sent[0].1, 13 * 3600);
}

#[tokio::test]
async fn start_calling_again_redelivers_abandoned_jobs() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec.clone(), weekday_morning());
    let search = seed_search(&h, "s-restart", &["p1", "p2"]).await;
    h.scheduler.start_calling(&search).await.unwrap();
    h.dispatcher.take();
    strand_in_processing(&h, &search, "p1").await;

    h.clock.advance(Duration::hours(1));
    let report = h.scheduler.start_calling(&search).await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(report.skipped, 1);

    let sent = h.dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, task(&search, "p1", 1));
    assert_eq!(
        h.scheduler.process_job(&sent[0].0).await.unwrap(),
        ProcessOutcome::Completed
    );
}

// --- edge cases ------------------------------------------------------------

#[tokio::test]
async fn start_calling_twice_does_not_duplicate_jobs_or_deliveries() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec, weekday_morning());
    let search = seed_search(&h, "s-idem", &["p1", "p2"]).await;

    let first = h.scheduler.start_calling(&search).await.unwrap();
    let second = h.scheduler.start_calling(&search).await.unwrap();
    assert_eq!(first.enqueued, 2);
    assert_eq!(second.jobs_created, 2);
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(h.dispatcher.take().len(), 2);
    assert_eq!(h.scheduler.jobs_for_search(&search).await.unwrap().len(), 2);
}

#[tokio::test]
async fn enqueue_failure_downgrades_each_job() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec, weekday_morning());
    h.dispatcher.fail.store(true, Ordering::SeqCst);
    let search = seed_search(&h, "s-fail", &["p1", "p2"]).await;

    let report = h.scheduler.start_calling(&search).await.unwrap();
    assert_eq!(report.enqueued, 0);
    assert_eq!(report.failed, 2);

    for p in ["p1", "p2"] {
        let j = job(&h, &search, p).await;
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error_message.as_deref(), Some(ENQUEUE_FAILED_REASON));
    }
}

#[tokio::test]
async fn empty_selection_is_rejected() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec, weekday_morning());
    let search = seed_search(&h, "s-empty", &[]).await;

    let err = h.scheduler.start_calling(&search).await.unwrap_err();
    assert_eq!(err.code(), "NO_PHARMACIES_SELECTED");

    let err = h
        .scheduler
        .start_calling(&SearchId::from("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SEARCH_NOT_FOUND");
}

#[tokio::test]
async fn unknown_job_delivery_fails_loudly() {
    let exec = Arc::new(ScriptedExecutor::always(success()));
    let h = harness(exec, weekday_morning());
    let err = h
        .scheduler
        .process_job(&task(&SearchId::from("nope"), "p1", 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "JOB_NOT_FOUND");
}

#[tokio::test]
async fn executor_panic_counts_as_failed_attempt() {
    let h = harness(Arc::new(PanickingExecutor), weekday_morning());
    let search = seed_search(&h, "s-panic", &["p1"]).await;
    h.scheduler.start_calling(&search).await.unwrap();

    let outcome = h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::RetryScheduled { attempt: 2, .. }
    ));
    let j = job(&h, &search, "p1").await;
    assert_eq!(j.error_message.as_deref(), Some("call_failed"));
}

#[tokio::test]
async fn retry_landing_after_close_is_pushed_to_next_morning() {
    let exec = Arc::new(ScriptedExecutor::always(CallOutcome::failed("busy")));
    // Wednesday 18:45 EST
    let h = harness(exec.clone(), Utc.with_ymd_and_hms(2024, 1, 3, 23, 45, 0).unwrap());
    let search = seed_search(&h, "s-late", &["p1"]).await;
    h.scheduler.start_calling(&search).await.unwrap();

    h.scheduler.process_job(&task(&search, "p1", 1)).await.unwrap();
    h.clock.advance(Duration::seconds(1800));

    let outcome = h.scheduler.process_job(&task(&search, "p1", 2)).await.unwrap();
    let thursday_open = Utc.with_ymd_and_hms(2024, 1, 4, 14, 0, 0).unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Rescheduled {
            scheduled_for: thursday_open
        }
    );
    let j = job(&h, &search, "p1").await;
    assert_eq!(j.attempt_count, 2);
    assert_eq!(j.status, JobStatus::RetryScheduled);
    assert_eq!(exec.calls(), 1);
}
