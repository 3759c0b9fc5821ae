//! Failed-job strategies: what happens to a job after a failed attempt.
//!
//! The strategy only decides; the failure command applies the decision in its
//! own unit of work, after the failed execution was rolled back.

use chrono::{DateTime, Duration, Utc};

use jobflow_core::{RetrySchedule, saturating_add};

use crate::jobs::{FailureDetail, Job};

/// Outcome of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at `due_date` with `retries_left` attempts remaining.
    Retry {
        retries_left: u32,
        due_date: DateTime<Utc>,
    },
    /// Out of retries: set retries to 0 and raise an incident.
    Incident,
}

/// Pluggable failure policy.
pub trait FailedJobStrategy: Send + Sync + std::fmt::Debug {
    fn decide(&self, job: &Job, failure: &FailureDetail, now: DateTime<Utc>) -> RetryDecision;
}

/// Retries left after this failure.
///
/// A job with its own retry schedule gets the schedule's attempt count on its first
/// failure, replacing the creation-time default.
pub fn retries_after_failure(job: &Job) -> u32 {
    let available = match (&job.retry_schedule, job.failed_attempts) {
        (Some(schedule), 0) => schedule.attempts(),
        _ => job.retries,
    };
    available.saturating_sub(1)
}

/// Default policy: decrement retries; back off per the job's own schedule,
/// else the executor-wide sequence, else a fixed delay.
#[derive(Debug, Clone)]
pub struct DefaultFailedJobStrategy {
    backoff: Option<RetrySchedule>,
    default_delay: Duration,
}

impl DefaultFailedJobStrategy {
    pub fn new(backoff: Option<RetrySchedule>, default_delay: Duration) -> Self {
        Self {
            backoff,
            default_delay,
        }
    }

    pub fn delay_for(&self, job: &Job) -> Duration {
        job.retry_schedule
            .as_ref()
            .or(self.backoff.as_ref())
            .map(|s| s.delay_for(job.failed_attempts))
            .unwrap_or(self.default_delay)
    }
}

impl Default for DefaultFailedJobStrategy {
    fn default() -> Self {
        Self::new(None, Duration::seconds(10))
    }
}

impl FailedJobStrategy for DefaultFailedJobStrategy {
    fn decide(&self, job: &Job, _failure: &FailureDetail, now: DateTime<Utc>) -> RetryDecision {
        let retries_left = retries_after_failure(job);
        if retries_left == 0 {
            return RetryDecision::Incident;
        }
        RetryDecision::Retry {
            retries_left,
            due_date: saturating_add(now, self.delay_for(job)),
        }
    }
}

/// Exponential backoff: `base * 2^(failures)`, capped at `max_delay`.
///
/// Ignores per-job schedules; useful when jobs carry no schedule and the
/// delays should grow without listing them.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffStrategy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ExponentialBackoffStrategy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::zero();
        }
        let base_ms = self.base_delay.num_milliseconds() as f64;
        let max_ms = self.max_delay.num_milliseconds() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
        Duration::milliseconds((base_ms * exp).min(max_ms).max(0.0) as i64)
    }
}

impl FailedJobStrategy for ExponentialBackoffStrategy {
    fn decide(&self, job: &Job, _failure: &FailureDetail, now: DateTime<Utc>) -> RetryDecision {
        let retries_left = job.retries.saturating_sub(1);
        if retries_left == 0 {
            return RetryDecision::Incident;
        }
        RetryDecision::Retry {
            retries_left,
            due_date: saturating_add(now, self.delay_for_attempt(job.failed_attempts + 1)),
        }
    }
}
