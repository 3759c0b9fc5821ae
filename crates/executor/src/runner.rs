//! Runs one job end to end: execute, and on failure apply the failure policy
//! in a separate unit of work.
//!
//! Nothing escapes [`JobRunner::run`]; every outcome is reported as a value.

use std::sync::Arc;

use tracing::{debug, error, warn};

use jobflow_core::{JobId, LockOwner};

use crate::commands::{
    ExecuteJobCommand, ExecutionOutcome, FailureOutcome, HandleJobFailureCommand,
};
use crate::failure::FailedJobStrategy;
use crate::handler::{Cancellation, JobHandlerRegistry};
use crate::jobs::FailureDetail;
use crate::pipeline::{CommandError, CommandPipeline, InvocationContext};
use crate::stats::ExecutorStats;

/// What happened to one job.
#[derive(Debug, Clone)]
pub enum JobRunReport {
    Completed,
    /// Nothing ran: the job was gone, locked by someone else or suspended.
    Skipped(ExecutionOutcome),
    /// Lost an optimistic-lock race while committing; another node won.
    Raced(CommandError),
    /// The attempt failed and the failure policy was applied. `outcome` is
    /// `None` if the job vanished or was re-acquired in the meantime.
    Failed {
        failure: FailureDetail,
        outcome: Option<FailureOutcome>,
    },
    /// The attempt failed and recording the failure failed too. The job's
    /// lock will expire and it will be retried.
    FailureNotRecorded {
        failure: FailureDetail,
        error: CommandError,
    },
}

impl JobRunReport {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobRunReport::Completed)
    }

    pub(crate) fn record_into(&self, stats: &mut ExecutorStats) {
        match self {
            JobRunReport::Completed => stats.jobs_succeeded += 1,
            JobRunReport::Skipped(_) | JobRunReport::Raced(_) => stats.jobs_skipped += 1,
            JobRunReport::Failed { outcome, .. } => {
                stats.jobs_failed += 1;
                if matches!(outcome, Some(FailureOutcome::IncidentRaised(_))) {
                    stats.incidents_raised += 1;
                }
            }
            JobRunReport::FailureNotRecorded { .. } => stats.jobs_failed += 1,
        }
    }
}

/// Executes jobs through the command pipeline.
pub struct JobRunner {
    pipeline: CommandPipeline,
    handlers: Arc<JobHandlerRegistry>,
    strategy: Arc<dyn FailedJobStrategy>,
    default_retries: u32,
}

impl JobRunner {
    pub fn new(
        pipeline: CommandPipeline,
        handlers: Arc<JobHandlerRegistry>,
        strategy: Arc<dyn FailedJobStrategy>,
        default_retries: u32,
    ) -> Self {
        Self {
            pipeline,
            handlers,
            strategy,
            default_retries,
        }
    }

    /// Run a job. With `lock_owner` the job must still be locked by it.
    pub fn run(
        &self,
        job_id: JobId,
        lock_owner: Option<&LockOwner>,
        invocation: InvocationContext,
        cancellation: &Cancellation,
    ) -> JobRunReport {
        let execute = ExecuteJobCommand::new(
            job_id,
            lock_owner.cloned(),
            self.handlers.clone(),
            cancellation.clone(),
            self.default_retries,
        );

        let err = match self.pipeline.execute(&execute, invocation.clone()) {
            Ok(ExecutionOutcome::Completed) => return JobRunReport::Completed,
            Ok(other) => return JobRunReport::Skipped(other),
            Err(err) if err.is_benign_race() => {
                debug!(job_id = %job_id, error = %err, "job execution lost a race");
                return JobRunReport::Raced(err);
            }
            Err(err) => err,
        };

        let failure = err.failure_detail();
        warn!(job_id = %job_id, error = %failure.message, "job execution failed");

        let handle_failure = HandleJobFailureCommand::new(
            job_id,
            failure.clone(),
            lock_owner.cloned(),
            self.strategy.clone(),
        );
        match self.pipeline.execute(&handle_failure, invocation) {
            Ok(outcome) => JobRunReport::Failed { failure, outcome },
            Err(error) => {
                error!(
                    job_id = %job_id,
                    error = %error,
                    "failed to record job failure; job will be retried after its lock expires"
                );
                JobRunReport::FailureNotRecorded { failure, error }
            }
        }
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("pipeline", &self.pipeline)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use jobflow_core::{Clock, ManualClock};

    use super::*;
    use crate::failure::DefaultFailedJobStrategy;
    use crate::jobs::{InMemoryJobStore, JobStore, NewJob};

    fn setup() -> (Arc<InMemoryJobStore>, Arc<JobHandlerRegistry>, JobRunner) {
        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlerRegistry::new());
        let pipeline =
            CommandPipeline::builder(store.clone(), Arc::new(ManualClock::starting_now())).build();
        let runner = JobRunner::new(
            pipeline,
            handlers.clone(),
            Arc::new(DefaultFailedJobStrategy::default()),
            3,
        );
        (store, handlers, runner)
    }

    fn insert(store: &InMemoryJobStore, job: NewJob) -> JobId {
        let job = job.into_job(ManualClock::starting_now().now(), 3);
        let id = job.id;
        let mut tx = store.begin().unwrap();
        tx.insert_job(job).unwrap();
        tx.commit().unwrap();
        id
    }

    #[test]
    fn missing_job_is_skipped() {
        let (_store, _handlers, runner) = setup();
        let report = runner.run(JobId::new(), None, InvocationContext::system(), &Cancellation::new());
        assert!(matches!(
            report,
            JobRunReport::Skipped(ExecutionOutcome::AlreadyHandled)
        ));
    }

    #[test]
    fn unknown_handler_type_counts_as_a_failure() {
        let (store, _handlers, runner) = setup();
        let id = insert(&store, NewJob::new("nobody.handles.this", ""));

        let report = runner.run(id, None, InvocationContext::system(), &Cancellation::new());
        match &report {
            JobRunReport::Failed {
                failure,
                outcome: Some(FailureOutcome::Retried { retries_left, .. }),
            } => {
                assert!(failure.message.contains("nobody.handles.this"));
                assert_eq!(*retries_left, 2);
            }
            other => panic!("unexpected report {other:?}"),
        }

        let mut stats = ExecutorStats::default();
        report.record_into(&mut stats);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.incidents_raised, 0);
    }

    #[test]
    fn panicking_handler_is_reported_and_job_survives() {
        let (store, handlers, runner) = setup();
        handlers.register_fn("explode", |_, _| panic!("handler blew up"));
        let id = insert(&store, NewJob::new("explode", "").with_retries(1));

        let report = runner.run(id, None, InvocationContext::system(), &Cancellation::new());
        let mut stats = ExecutorStats::default();
        report.record_into(&mut stats);
        assert_eq!(stats.incidents_raised, 1);

        let job = store.find_job(id).unwrap().unwrap();
        assert_eq!(job.retries, 0);
        assert_eq!(job.exception_message.as_deref(), Some("handler blew up"));
    }
}
