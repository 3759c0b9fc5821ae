//! Commands run through the [`CommandPipeline`](crate::pipeline::CommandPipeline).
//!
//! - `ExecuteJobCommand`: run a job's handler and delete the job on success
//! - `HandleJobFailureCommand`: apply the failed-job strategy, in a unit of
//!   work separate from the (rolled back) execution
//! - `CreateJobCommand`, `SetJobRetriesCommand`, `SetJobSuspensionCommand`,
//!   `DeleteJobCommand`: management mutations

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use jobflow_core::{JobId, LockOwner};

use crate::failure::{FailedJobStrategy, RetryDecision};
use crate::handler::{Cancellation, JobContext, JobHandlerRegistry};
use crate::jobs::{FailureDetail, Incident, JobStoreError, NewJob};
use crate::pipeline::{Command, CommandContext, CommandError};

/// Result of a job execution that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded; the job was deleted.
    Completed,
    /// The job no longer exists (completed or deleted elsewhere).
    AlreadyHandled,
    /// The job is locked by another owner now; we lost it.
    LockLost,
    /// The job was suspended after being acquired; its lock was released.
    Suspended,
}

/// Execute one job.
///
/// With a lock owner the job must still be locked by that owner (acquired
/// execution); without one the lock is ignored (forced execution).
pub struct ExecuteJobCommand {
    job_id: JobId,
    lock_owner: Option<LockOwner>,
    handlers: Arc<JobHandlerRegistry>,
    cancellation: Cancellation,
    default_retries: u32,
}

impl ExecuteJobCommand {
    pub fn new(
        job_id: JobId,
        lock_owner: Option<LockOwner>,
        handlers: Arc<JobHandlerRegistry>,
        cancellation: Cancellation,
        default_retries: u32,
    ) -> Self {
        Self {
            job_id,
            lock_owner,
            handlers,
            cancellation,
            default_retries,
        }
    }
}

impl Command for ExecuteJobCommand {
    type Output = ExecutionOutcome;

    fn name(&self) -> &'static str {
        "ExecuteJob"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<ExecutionOutcome, CommandError> {
        let tx = ctx.transaction()?;
        let job = match tx.load_job(self.job_id) {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_id = %self.job_id, "job already handled");
                return Ok(ExecutionOutcome::AlreadyHandled);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(owner) = &self.lock_owner {
            if !job.is_locked_by(owner) {
                debug!(
                    job_id = %job.id,
                    lock_owner = ?job.lock_owner,
                    "job lock lost before execution"
                );
                return Ok(ExecutionOutcome::LockLost);
            }
            if job.suspended {
                let mut released = job.clone();
                released.clear_lock();
                tx.update_job(&released)?;
                return Ok(ExecutionOutcome::Suspended);
            }
        }

        let handler = self
            .handlers
            .get(&job.handler_type)
            .ok_or_else(|| CommandError::UnknownHandlerType(job.handler_type.clone()))?;

        let result = {
            let mut job_ctx = JobContext::new(&job, ctx, &self.cancellation, self.default_retries);
            catch_unwind(AssertUnwindSafe(|| {
                handler.execute(&job.handler_configuration, &mut job_ctx)
            }))
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(CommandError::HandlerFailed(FailureDetail::from_error(&e))),
            Err(payload) => {
                return Err(CommandError::HandlerFailed(FailureDetail::from_panic(
                    payload.as_ref(),
                )));
            }
        }

        ctx.transaction()?.delete_job(job.id)?;
        debug!(job_id = %job.id, handler_type = %job.handler_type, "job completed");
        Ok(ExecutionOutcome::Completed)
    }
}

/// What the failure policy did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retried {
        retries_left: u32,
        due_date: DateTime<Utc>,
    },
    IncidentRaised(Incident),
}

/// Record a failed attempt and decide about retries.
///
/// Returns `None` when there is nothing to record: the job is gone, or another
/// owner has re-acquired it in the meantime.
pub struct HandleJobFailureCommand {
    job_id: JobId,
    failure: FailureDetail,
    lock_owner: Option<LockOwner>,
    strategy: Arc<dyn FailedJobStrategy>,
}

impl HandleJobFailureCommand {
    pub fn new(
        job_id: JobId,
        failure: FailureDetail,
        lock_owner: Option<LockOwner>,
        strategy: Arc<dyn FailedJobStrategy>,
    ) -> Self {
        Self {
            job_id,
            failure,
            lock_owner,
            strategy,
        }
    }
}

impl Command for HandleJobFailureCommand {
    type Output = Option<FailureOutcome>;

    fn name(&self) -> &'static str {
        "HandleJobFailure"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<Option<FailureOutcome>, CommandError> {
        let now = ctx.now();
        let tx = ctx.transaction()?;
        let job = match tx.load_job(self.job_id) {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let (Some(ours), Some(theirs)) = (&self.lock_owner, &job.lock_owner) {
            if ours != theirs {
                debug!(
                    job_id = %job.id,
                    lock_owner = %theirs,
                    "job re-acquired by another owner; failure not recorded"
                );
                return Ok(None);
            }
        }

        let decision = catch_unwind(AssertUnwindSafe(|| {
            self.strategy.decide(&job, &self.failure, now)
        }))
        .unwrap_or_else(|payload| {
            let cause = FailureDetail::from_panic(payload.as_ref());
            warn!(
                job_id = %job.id,
                error = %cause.message,
                "failed-job strategy panicked, raising an incident"
            );
            RetryDecision::Incident
        });

        match decision {
            RetryDecision::Retry {
                retries_left,
                due_date,
            } => {
                tx.record_failure(job.id, &self.failure, retries_left, due_date, now)?;
                info!(
                    job_id = %job.id,
                    retries_left,
                    due_date = %due_date,
                    "job failed, retry scheduled"
                );
                Ok(Some(FailureOutcome::Retried {
                    retries_left,
                    due_date,
                }))
            }
            RetryDecision::Incident => {
                tx.record_failure(job.id, &self.failure, 0, now, now)?;
                let incident = tx.create_incident(job.id, &self.failure, now)?;
                warn!(
                    job_id = %job.id,
                    incident_id = %incident.id,
                    error = %self.failure.message,
                    "job out of retries, incident raised"
                );
                Ok(Some(FailureOutcome::IncidentRaised(incident)))
            }
        }
    }
}

/// Persist a new job.
pub struct CreateJobCommand {
    job: NewJob,
    default_retries: u32,
}

impl CreateJobCommand {
    pub fn new(job: NewJob, default_retries: u32) -> Self {
        Self {
            job,
            default_retries,
        }
    }
}

impl Command for CreateJobCommand {
    type Output = JobId;

    fn name(&self) -> &'static str {
        "CreateJob"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<JobId, CommandError> {
        if self.job.handler_type.trim().is_empty() {
            return Err(CommandError::InvalidArgument(
                "handler type must not be empty".to_string(),
            ));
        }
        let job = self.job.clone().into_job(ctx.now(), self.default_retries);
        let id = job.id;
        ctx.transaction()?.insert_job(job)?;
        debug!(job_id = %id, handler_type = %self.job.handler_type, "job created");
        Ok(id)
    }
}

/// Set a job's remaining retries.
///
/// Going from 0 to a positive count resolves the job's incident and makes it
/// acquirable again; going to 0 raises one.
pub struct SetJobRetriesCommand {
    job_id: JobId,
    retries: u32,
}

impl SetJobRetriesCommand {
    pub fn new(job_id: JobId, retries: u32) -> Self {
        Self { job_id, retries }
    }
}

impl Command for SetJobRetriesCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetJobRetries"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), CommandError> {
        let now = ctx.now();
        let tx = ctx.transaction()?;
        let mut job = tx.load_job(self.job_id)?;
        let previous = job.retries;
        job.retries = self.retries;
        tx.update_job(&job)?;

        if previous == 0 && self.retries > 0 {
            let resolved = tx.resolve_incidents(job.id, now)?;
            info!(job_id = %job.id, retries = self.retries, resolved, "job retries restored");
        } else if previous > 0 && self.retries == 0 {
            let failure = FailureDetail::new(
                job.exception_message
                    .clone()
                    .unwrap_or_else(|| "retries set to 0".to_string()),
                job.exception_stacktrace.clone().unwrap_or_default(),
            );
            tx.create_incident(job.id, &failure, now)?;
        }
        Ok(())
    }
}

/// Suspend or activate a job. Suspended jobs are invisible to acquisition.
pub struct SetJobSuspensionCommand {
    job_id: JobId,
    suspended: bool,
}

impl SetJobSuspensionCommand {
    pub fn new(job_id: JobId, suspended: bool) -> Self {
        Self { job_id, suspended }
    }
}

impl Command for SetJobSuspensionCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        if self.suspended { "SuspendJob" } else { "ActivateJob" }
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), CommandError> {
        let tx = ctx.transaction()?;
        let mut job = tx.load_job(self.job_id)?;
        if job.suspended == self.suspended {
            return Ok(());
        }
        job.suspended = self.suspended;
        tx.update_job(&job).map_err(CommandError::from)
    }
}

/// Delete a job and resolve its incidents. Refused while the job is locked.
pub struct DeleteJobCommand {
    job_id: JobId,
}

impl DeleteJobCommand {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

impl Command for DeleteJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteJob"
    }

    fn execute(&self, ctx: &mut CommandContext) -> Result<(), CommandError> {
        let now = ctx.now();
        let tx = ctx.transaction()?;
        let job = tx.load_job(self.job_id)?;
        if job.holds_lock(now, Duration::zero()) {
            return Err(CommandError::JobLocked(job.id));
        }
        tx.resolve_incidents(job.id, now)?;
        tx.delete_job(job.id)?;
        Ok(())
    }
}
