//! Retry policy: exponential backoff with deterministic jitter.
//!
//! Stateless, same shape as the other policy types in this module -- all
//! logic in associated functions taking configuration as parameters. The
//! jitter is derived from the run id and attempt number rather than a
//! random source, so a replayed transition computes the identical schedule
//! while distinct runs still spread out.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::hash::stable_bucket;

/// Retry schedule configuration.
///
/// The defaults (30s base, factor 2, 1h cap, 3 retries) are reasonable,
/// not contractual -- deployments tune them through `EngineConfig`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry, in seconds.
    pub base_secs: u64,
    /// Multiplier applied per subsequent retry.
    pub factor: u32,
    /// Upper bound on any single delay, in seconds.
    pub cap_secs: u64,
    /// Retries allowed before quarantine.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            factor: 2,
            cap_secs: 3_600,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Whether another retry may be scheduled given the retries already
    /// consumed. At the cap the run goes to the dead-letter queue instead.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// The base delay for retry number `attempt` (1-based), before jitter.
    pub fn delay_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = u64::from(self.factor).saturating_pow(exponent);
        self.base_secs.saturating_mul(factor).min(self.cap_secs)
    }

    /// Deterministic jitter for this run and attempt: up to 25% of the base
    /// delay, derived from a stable hash so replays agree.
    pub fn jitter_secs(&self, run_id: Uuid, attempt: u32) -> u64 {
        let quarter = (self.delay_secs(attempt) / 4).max(1);
        stable_bucket(&format!("{run_id}:{attempt}"), quarter)
    }

    /// When retry number `attempt` (1-based) should fire.
    pub fn next_retry_at(
        &self,
        run_id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let secs = self.delay_secs(attempt) + self.jitter_secs(run_id, attempt);
        now + Duration::seconds(secs.min(i64::MAX as u64) as i64)
    }
}
