//! Job store contract.
//!
//! ## Design
//!
//! - `claim_due_jobs` is the only multi-node coordination point: it must
//!   atomically pick due, unlocked jobs and lock them for one owner. Two
//!   concurrent claims never return the same job.
//! - All other writes go through a [`Transaction`]. Changes become visible on
//!   `commit` and are discarded on `rollback` (or drop).
//! - Writes are optimistically versioned: if a job changed since the
//!   transaction read it, `commit` fails with [`JobStoreError::Conflict`].
//!
//! Implementations: [`InMemoryJobStore`](super::InMemoryJobStore) for tests and
//! single-process use, `PostgresJobStore` behind the `postgres` feature.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use jobflow_core::{JobId, LockOwner, ProcessInstanceId, saturating_add};

use super::types::{FailureDetail, FailureRecord, Incident, Job, JobState};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Optimistic lock failure: someone else changed the job first.
    #[error("concurrent modification of job {job_id}: {reason}")]
    Conflict { job_id: JobId, reason: String },
    #[error("transaction already finished")]
    TransactionClosed,
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn conflict(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::Conflict {
            job_id,
            reason: reason.into(),
        }
    }
}

/// Parameters of one acquisition claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub max_jobs: usize,
    pub now: DateTime<Utc>,
    pub lock_owner: LockOwner,
    pub lock_duration: Duration,
    /// A foreign lock only counts as expired once it is this far in the past.
    pub clock_skew_tolerance: Duration,
}

impl ClaimRequest {
    pub fn lock_expiration(&self) -> DateTime<Utc> {
        saturating_add(self.now, self.lock_duration)
    }
}

/// Query filter for management listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub process_instance_id: Option<ProcessInstanceId>,
    pub handler_type: Option<String>,
    pub state: Option<JobState>,
    pub suspended: Option<bool>,
    /// Only jobs that recorded an exception.
    pub with_exception: bool,
    /// Only jobs acquisition could claim right now.
    pub executable: bool,
    /// Only jobs whose retries are exhausted.
    pub no_retries_left: bool,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn process_instance(mut self, id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    /// Match the derived [`JobState`]. Suspended jobs still match their
    /// derived state; add `.suspended(false)` to leave them out.
    pub fn in_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    pub fn with_exception(mut self) -> Self {
        self.with_exception = true;
        self
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn no_retries_left(mut self) -> Self {
        self.no_retries_left = true;
        self
    }

    pub fn matches(&self, job: &Job, now: DateTime<Utc>, clock_skew_tolerance: Duration) -> bool {
        self.process_instance_id
            .is_none_or(|id| job.process_instance_id == Some(id))
            && self
                .handler_type
                .as_deref()
                .is_none_or(|t| job.handler_type == t)
            && self
                .state
                .is_none_or(|s| job.state(now, clock_skew_tolerance) == s)
            && self.suspended.is_none_or(|s| job.suspended == s)
            && (!self.with_exception || job.exception_message.is_some())
            && (!self.executable || job.is_acquirable(now, clock_skew_tolerance))
            && (!self.no_retries_left || job.retries == 0)
    }
}

/// Counts of jobs per derived state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    /// Pending and due now (suspended jobs excluded).
    pub executable: usize,
    pub pending: usize,
    pub locked: usize,
    pub failed_retryable: usize,
    /// Jobs with no retries left.
    pub incident: usize,
    pub suspended: usize,
    pub open_incidents: usize,
}

impl JobStats {
    pub fn count(&mut self, job: &Job, now: DateTime<Utc>, clock_skew_tolerance: Duration) {
        self.total += 1;
        if job.suspended {
            self.suspended += 1;
        }
        if job.is_acquirable(now, clock_skew_tolerance) {
            self.executable += 1;
        }
        match job.state(now, clock_skew_tolerance) {
            JobState::Pending => self.pending += 1,
            JobState::Locked => self.locked += 1,
            JobState::FailedRetryable => self.failed_retryable += 1,
            JobState::Incident => self.incident += 1,
        }
    }
}

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Atomically claim up to `max_jobs` due jobs for `lock_owner`.
    ///
    /// Candidates are unlocked (or lock-expired), not suspended, due and have
    /// retries left. Order: priority descending, due date ascending, then
    /// creation order. Exclusive jobs are skipped when another exclusive job of
    /// the same process instance is locked or already part of this batch.
    fn claim_due_jobs(&self, request: &ClaimRequest) -> Result<Vec<JobId>, JobStoreError>;

    /// Release locks held by `owner`. Jobs locked by someone else are left alone.
    fn unlock_jobs(&self, ids: &[JobId], owner: &LockOwner) -> Result<(), JobStoreError>;

    /// Open a unit of work.
    fn begin(&self) -> Result<Box<dyn Transaction>, JobStoreError>;

    fn find_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn list_jobs(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    fn list_incidents(&self, open_only: bool, limit: usize) -> Result<Vec<Incident>, JobStoreError>;

    /// Failure records of one job, oldest first.
    fn failure_log(&self, id: JobId) -> Result<Vec<FailureRecord>, JobStoreError>;

    fn stats(
        &self,
        now: DateTime<Utc>,
        clock_skew_tolerance: Duration,
    ) -> Result<JobStats, JobStoreError>;
}

/// A unit of work against the store.
///
/// Dropping an open transaction without committing discards its changes.
pub trait Transaction: Send {
    /// Read a job; fails with [`JobStoreError::NotFound`] if it does not exist.
    fn load_job(&mut self, id: JobId) -> Result<Job, JobStoreError>;

    fn insert_job(&mut self, job: Job) -> Result<(), JobStoreError>;

    /// Persist changes to a previously loaded job.
    ///
    /// `job.version` must be the version that was read.
    fn update_job(&mut self, job: &Job) -> Result<(), JobStoreError>;

    fn delete_job(&mut self, id: JobId) -> Result<(), JobStoreError>;

    /// Record a failed attempt: set retries and due date, store the exception,
    /// release the lock and append to the failure log.
    fn record_failure(
        &mut self,
        id: JobId,
        failure: &FailureDetail,
        retries_left: u32,
        new_due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, JobStoreError>;

    /// Create a failed-job incident. At most one open incident exists per
    /// job; if one is already open it is returned unchanged.
    fn create_incident(
        &mut self,
        job_id: JobId,
        failure: &FailureDetail,
        now: DateTime<Utc>,
    ) -> Result<Incident, JobStoreError>;

    /// Resolve the open incidents of a job, returning how many were resolved.
    fn resolve_incidents(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<usize, JobStoreError>;

    fn commit(self: Box<Self>) -> Result<(), JobStoreError>;

    fn rollback(self: Box<Self>) -> Result<(), JobStoreError>;
}
