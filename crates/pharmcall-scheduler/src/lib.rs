//! `pharmcall-scheduler`: pharmacy-call job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! [`engine::CallScheduler::start_calling`] turns a search's selected
//! pharmacies into one job each and hands them to a [`dispatch::TaskDispatcher`],
//! delayed until the next calling window when needed. Every delivery lands in
//! [`engine::CallScheduler::process_job`], which decides the job's fate:
//!
//! | Check                      | Outcome                                   |
//! |----------------------------|-------------------------------------------|
//! | terminal, in flight, stale | skipped, no side effects                  |
//! | other job called < 1h ago  | `failed` ("Rate limited"), no retry       |
//! | outside Mon–Fri 9:00–19:00 | `retry_scheduled` at next window opening  |
//! | call succeeded             | `completed` with extracted result         |
//! | call failed, attempts left | `retry_scheduled` after 30m, then 2h      |
//! | call failed, exhausted     | `failed`                                  |

pub mod clock;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod rate;
pub mod retry;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod window;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{DispatchError, JobTask, LocalDispatcher, QStashDispatcher, TaskDispatcher};
pub use engine::CallScheduler;
pub use error::{Result, SchedulerError};
pub use executor::{CallExecutor, CallOutcome};
pub use rate::{RateGuard, RateMarker, RateMarkerStore};
pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;
pub use store::{JobStore, SearchStore};
pub use types::{
    CallProvider, CallRecord, CallStatus, ExtractedData, Job, JobMetrics, JobPatch, JobStatus,
    NewJob, ProcessOutcome, Search, SearchStatus, SelectedPharmacy, SkipReason, StartReport,
};
pub use window::CallingWindow;
