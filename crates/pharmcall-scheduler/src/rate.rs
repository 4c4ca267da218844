use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pharmcall_core::{JobId, PharmacyId};
use tracing::debug;

use crate::error::Result;

/// Last call placed to a pharmacy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateMarker {
    pub last_called_at: DateTime<Utc>,
    /// Job that placed the call; `None` for manually recorded attempts.
    pub job_id: Option<JobId>,
}

/// Persistence for per-pharmacy "last called" markers.
///
/// Markers are global across searches and users.
#[async_trait]
pub trait RateMarkerStore: Send + Sync {
    async fn last_called(&self, pharmacy: &PharmacyId) -> Result<Option<RateMarker>>;

    /// Overwrite the marker unconditionally.
    async fn set_last_called(
        &self,
        pharmacy: &PharmacyId,
        at: DateTime<Utc>,
        job: Option<&JobId>,
    ) -> Result<()>;

    /// Set the marker to `(at, job)` only if it is absent, older than or equal
    /// to `cutoff`, or already owned by `job`. Returns whether the write
    /// happened.
    async fn compare_and_set_last_called(
        &self,
        pharmacy: &PharmacyId,
        at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        job: &JobId,
    ) -> Result<bool>;
}

/// Enforces a minimum gap between calls to the same pharmacy.
///
/// The gap applies between different jobs. A job retrying its own call is
/// paced by the retry ladder instead.
#[derive(Clone)]
pub struct RateGuard {
    markers: Arc<dyn RateMarkerStore>,
    cooldown: Duration,
}

impl RateGuard {
    pub fn new(markers: Arc<dyn RateMarkerStore>, cooldown_secs: u64) -> Self {
        Self {
            markers,
            cooldown: Duration::seconds(cooldown_secs as i64),
        }
    }

    /// `true` if nobody called `pharmacy` within the cooldown.
    pub async fn can_call_now(&self, pharmacy: &PharmacyId, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.markers.last_called(pharmacy).await? {
            None => true,
            Some(marker) => now - marker.last_called_at >= self.cooldown,
        })
    }

    /// Like [`can_call_now`](Self::can_call_now), but a marker left by `job`
    /// itself never vetoes.
    pub async fn can_job_call_now(
        &self,
        pharmacy: &PharmacyId,
        job: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(match self.markers.last_called(pharmacy).await? {
            None => true,
            Some(marker) => {
                marker.job_id.as_ref() == Some(job) || now - marker.last_called_at >= self.cooldown
            }
        })
    }

    pub async fn record_call_attempt(&self, pharmacy: &PharmacyId, at: DateTime<Utc>) -> Result<()> {
        self.markers.set_last_called(pharmacy, at, None).await
    }

    /// Check and record in one conditional write. Two jobs racing for the
    /// same pharmacy cannot both get `true`.
    pub async fn try_acquire(
        &self,
        pharmacy: &PharmacyId,
        job: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired = self
            .markers
            .compare_and_set_last_called(pharmacy, now, now - self.cooldown, job)
            .await?;
        debug!(pharmacy_id = %pharmacy, job_id = %job, acquired, "rate guard acquire");
        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;
    use chrono::TimeZone;

    fn guard() -> RateGuard {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        RateGuard::new(store, 3600)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn unknown_pharmacy_may_be_called() {
        let g = guard();
        assert!(g.can_call_now(&PharmacyId::from("p1"), t0()).await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_boundary_is_inclusive() {
        let g = guard();
        let p = PharmacyId::from("p1");
        g.record_call_attempt(&p, t0()).await.unwrap();

        assert!(!g.can_call_now(&p, t0() + Duration::seconds(1)).await.unwrap());
        assert!(!g.can_call_now(&p, t0() + Duration::minutes(59)).await.unwrap());
        assert!(g.can_call_now(&p, t0() + Duration::hours(1)).await.unwrap());
    }

    #[tokio::test]
    async fn try_acquire_admits_one_job_per_cooldown() {
        let g = guard();
        let p = PharmacyId::from("p1");
        let a = JobId::from("job-a".to_string());
        let b = JobId::from("job-b".to_string());

        assert!(g.try_acquire(&p, &a, t0()).await.unwrap());
        assert!(!g.try_acquire(&p, &b, t0()).await.unwrap());
        assert!(!g.try_acquire(&p, &b, t0() + Duration::minutes(30)).await.unwrap());
        assert!(g.try_acquire(&p, &b, t0() + Duration::hours(1)).await.unwrap());
    }

    #[tokio::test]
    async fn own_marker_does_not_veto_retries() {
        let g = guard();
        let p = PharmacyId::from("p1");
        let a = JobId::from("job-a".to_string());
        let b = JobId::from("job-b".to_string());
        assert!(g.try_acquire(&p, &a, t0()).await.unwrap());

        let later = t0() + Duration::minutes(30);
        assert!(g.can_job_call_now(&p, &a, later).await.unwrap());
        assert!(!g.can_job_call_now(&p, &b, later).await.unwrap());
        assert!(!g.can_call_now(&p, later).await.unwrap());
        assert!(g.try_acquire(&p, &a, later).await.unwrap());
    }

    #[tokio::test]
    async fn markers_are_per_pharmacy() {
        let g = guard();
        let a = JobId::from("job-a".to_string());
        let b = JobId::from("job-b".to_string());
        assert!(g.try_acquire(&PharmacyId::from("p1"), &a, t0()).await.unwrap());
        assert!(g.try_acquire(&PharmacyId::from("p2"), &b, t0()).await.unwrap());
    }
}
