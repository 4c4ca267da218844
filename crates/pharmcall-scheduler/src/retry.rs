use pharmcall_core::config::{CallingConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAYS_SECS};

/// Backoff ladder for failed calls.
///
/// `delay_for_attempt(n)` is the wait before attempt `n` is delivered. The
/// default ladder is 5 minutes, 30 minutes, then 2 hours for anything later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays_secs: Vec<u64>,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays_secs: DEFAULT_RETRY_DELAYS_SECS.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// An empty ladder falls back to the defaults; `max_attempts` is at least 1.
    pub fn new(delays_secs: Vec<u64>, max_attempts: u32) -> Self {
        let delays_secs = if delays_secs.is_empty() {
            DEFAULT_RETRY_DELAYS_SECS.to_vec()
        } else {
            delays_secs
        };
        Self {
            delays_secs,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(cfg: &CallingConfig) -> Self {
        Self::new(cfg.retry_delays_secs.clone(), cfg.max_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff in seconds for the 1-based `attempt`. Attempts past the end of
    /// the ladder reuse its last step.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays_secs.len() - 1);
        self.delays_secs[idx]
    }
}
