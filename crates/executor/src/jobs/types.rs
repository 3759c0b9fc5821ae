//! Core job types: the persisted job, its derived state, failure details,
//! failure log records and incidents.

use std::any::Any;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use jobflow_core::{IncidentId, JobId, LockOwner, ProcessInstanceId, RetrySchedule, saturating_add};

/// Retries granted to a job created without an explicit count.
pub const DEFAULT_RETRIES: u32 = 3;

/// Incident type raised when a job runs out of retries.
pub const FAILED_JOB_INCIDENT_TYPE: &str = "failedJob";

/// A persisted unit of asynchronous work.
///
/// The lock fields are written by acquisition; `retries`, `due_date` and the
/// exception fields by the failure policy. `version` is bumped by every
/// committed change and used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Key into the handler registry.
    pub handler_type: String,
    /// Opaque configuration passed to the handler.
    pub handler_configuration: String,
    pub process_instance_id: Option<ProcessInstanceId>,
    /// Exclusive jobs of one process instance never run concurrently.
    pub exclusive: bool,
    pub priority: i64,
    pub due_date: DateTime<Utc>,
    pub retries: u32,
    /// Per-job retry schedule; overrides the executor-wide backoff.
    pub retry_schedule: Option<RetrySchedule>,
    /// Number of failures recorded so far.
    pub failed_attempts: u32,
    pub lock_owner: Option<LockOwner>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub suspended: bool,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

/// Lifecycle state derived from a job's fields.
///
/// Suspension is orthogonal: a suspended job keeps the state it would have
/// otherwise, so a suspended, unlocked job with retries left reports
/// `Pending` even though acquisition never claims it. Use
/// [`JobFilter::executable`](super::JobFilter::executable) or combine with
/// [`JobFilter::suspended`](super::JobFilter::suspended) to tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Unlocked with retries left; due now or scheduled for later.
    Pending,
    /// Held by a lock owner whose lock has not expired.
    Locked,
    /// Failed at least once and waiting for its backoff to elapse.
    FailedRetryable,
    /// No retries left. Only a management action revives it.
    Incident,
}

impl Job {
    /// Whether a lock is currently held, allowing for clock skew between nodes.
    pub fn holds_lock(&self, now: DateTime<Utc>, clock_skew_tolerance: Duration) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expires)) => saturating_add(expires, clock_skew_tolerance) >= now,
            _ => false,
        }
    }

    pub fn is_locked_by(&self, owner: &LockOwner) -> bool {
        self.lock_owner.as_ref() == Some(owner)
    }

    /// Whether acquisition may claim this job at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>, clock_skew_tolerance: Duration) -> bool {
        !self.suspended
            && self.retries > 0
            && self.due_date <= now
            && !self.holds_lock(now, clock_skew_tolerance)
    }

    pub fn state(&self, now: DateTime<Utc>, clock_skew_tolerance: Duration) -> JobState {
        if self.holds_lock(now, clock_skew_tolerance) {
            JobState::Locked
        } else if self.retries == 0 {
            JobState::Incident
        } else if self.failed_attempts > 0 && self.due_date > now {
            JobState::FailedRetryable
        } else {
            JobState::Pending
        }
    }

    pub(crate) fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}

/// Description of a job to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub handler_type: String,
    pub handler_configuration: String,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub exclusive: bool,
    pub priority: i64,
    /// `None` means due immediately.
    pub due_date: Option<DateTime<Utc>>,
    /// `None` falls back to the executor default.
    pub retries: Option<u32>,
    pub retry_schedule: Option<RetrySchedule>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>, handler_configuration: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            handler_configuration: handler_configuration.into(),
            process_instance_id: None,
            exclusive: true,
            priority: 0,
            due_date: None,
            retries: None,
            retry_schedule: None,
        }
    }

    pub fn for_process_instance(mut self, process_instance_id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule the job for later execution.
    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_date = Some(at);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.retry_schedule = Some(schedule);
        self
    }

    /// Materialize the job at `now`.
    pub fn into_job(self, now: DateTime<Utc>, default_retries: u32) -> Job {
        Job {
            id: JobId::new(),
            handler_type: self.handler_type,
            handler_configuration: self.handler_configuration,
            process_instance_id: self.process_instance_id,
            exclusive: self.exclusive,
            priority: self.priority,
            due_date: self.due_date.unwrap_or(now),
            retries: self.retries.unwrap_or(default_retries),
            retry_schedule: self.retry_schedule,
            failed_attempts: 0,
            lock_owner: None,
            lock_expiration_time: None,
            suspended: false,
            exception_message: None,
            exception_stacktrace: None,
            created_at: now,
            version: 0,
        }
    }
}

/// What went wrong during one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    /// Full error chain (or panic payload) for diagnosis.
    pub stacktrace: String,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: stacktrace.into(),
        }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stacktrace: format!("{err:?}"),
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            stacktrace: format!("job handler panicked: {message}"),
            message,
        }
    }
}

/// One entry of a job's failure log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub message: String,
    pub stacktrace: String,
    pub retries_left: u32,
    pub next_due_date: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted marker that a job exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub incident_type: String,
    pub job_id: JobId,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub message: String,
    pub stacktrace: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn failed_job(job: &Job, failure: &FailureDetail, now: DateTime<Utc>) -> Self {
        Self {
            id: IncidentId::new(),
            incident_type: FAILED_JOB_INCIDENT_TYPE.to_string(),
            job_id: job.id,
            process_instance_id: job.process_instance_id,
            message: failure.message.clone(),
            stacktrace: failure.stacktrace.clone(),
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_at(now: DateTime<Utc>) -> Job {
        NewJob::new("noop", "").into_job(now, DEFAULT_RETRIES)
    }

    #[test]
    fn new_job_is_due_immediately_with_default_retries() {
        let now = Utc::now();
        let job = job_at(now);
        assert_eq!(job.due_date, now);
        assert_eq!(job.retries, DEFAULT_RETRIES);
        assert!(job.exclusive);
        assert!(job.is_acquirable(now, Duration::zero()));
        assert_eq!(job.state(now, Duration::zero()), JobState::Pending);
    }

    #[test]
    fn expired_lock_is_reclaimable_only_past_skew() {
        let now = Utc::now();
        let mut job = job_at(now);
        job.lock_owner = Some(LockOwner::new("node-a").unwrap());
        job.lock_expiration_time = Some(now - Duration::seconds(5));

        assert!(job.is_acquirable(now, Duration::zero()));
        assert!(!job.is_acquirable(now, Duration::seconds(10)));
        assert_eq!(job.state(now, Duration::seconds(10)), JobState::Locked);
    }

    #[test]
    fn derived_states() {
        let now = Utc::now();
        let mut job = job_at(now);
        job.failed_attempts = 1;
        job.due_date = now + Duration::minutes(1);
        assert_eq!(job.state(now, Duration::zero()), JobState::FailedRetryable);
        assert!(!job.is_acquirable(now, Duration::zero()));

        job.retries = 0;
        assert_eq!(job.state(now, Duration::zero()), JobState::Incident);

        job.retries = 2;
        job.due_date = now;
        job.suspended = true;
        assert_eq!(job.state(now, Duration::zero()), JobState::Pending);
        assert!(!job.is_acquirable(now, Duration::zero()));
    }

    #[test]
    fn failure_detail_keeps_error_chain() {
        let err = anyhow::anyhow!("connection refused").context("calling billing service");
        let detail = FailureDetail::from_error(&err);
        assert_eq!(detail.message, "calling billing service");
        assert!(detail.stacktrace.contains("connection refused"));
    }

    #[test]
    fn failure_detail_from_panic_payloads() {
        let detail = FailureDetail::from_panic(&"boom");
        assert_eq!(detail.message, "boom");

        let owned: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(FailureDetail::from_panic(owned.as_ref()).message, "kaboom");
    }
}
