//! Management operations: create, execute, retry, suspend and delete jobs, and
//! read-only queries over jobs, incidents and failure history.
//!
//! Every write goes through the command pipeline, so user interceptors see
//! management calls the same way they see job executions.

use std::sync::Arc;

use jobflow_core::JobId;

use crate::acquisition::AcquisitionHint;
use crate::commands::{
    CreateJobCommand, DeleteJobCommand, SetJobRetriesCommand, SetJobSuspensionCommand,
};
use crate::handler::Cancellation;
use crate::jobs::{FailureRecord, Incident, Job, JobFilter, JobStats, NewJob};
use crate::pipeline::{CommandError, CommandPipeline, InvocationContext};
use crate::runner::{JobRunReport, JobRunner};

/// Entry point for operators and the surrounding engine.
#[derive(Debug, Clone)]
pub struct ManagementService {
    pipeline: CommandPipeline,
    runner: Arc<JobRunner>,
    hint: Option<AcquisitionHint>,
    default_retries: u32,
    clock_skew_tolerance: chrono::Duration,
}

impl ManagementService {
    pub(crate) fn new(
        pipeline: CommandPipeline,
        runner: Arc<JobRunner>,
        hint: Option<AcquisitionHint>,
        default_retries: u32,
        clock_skew_tolerance: chrono::Duration,
    ) -> Self {
        Self {
            pipeline,
            runner,
            hint,
            default_retries,
            clock_skew_tolerance,
        }
    }

    fn hint(&self) {
        if let Some(hint) = &self.hint {
            hint.hint();
        }
    }

    /// Persist a new job. Wakes acquisition if the job is due now.
    pub fn create_job(
        &self,
        job: NewJob,
        invocation: InvocationContext,
    ) -> Result<JobId, CommandError> {
        let due_now = job
            .due_date
            .is_none_or(|due| due <= self.pipeline.clock().now());
        let id = self
            .pipeline
            .execute(&CreateJobCommand::new(job, self.default_retries), invocation)?;
        if due_now {
            self.hint();
        }
        Ok(id)
    }

    /// Execute a job synchronously on the calling thread, ignoring due date
    /// and locks. Failures are handled exactly as for acquired jobs.
    pub fn execute_job(
        &self,
        job_id: JobId,
        invocation: InvocationContext,
    ) -> Result<JobRunReport, CommandError> {
        if self.pipeline.store().find_job(job_id)?.is_none() {
            return Err(CommandError::JobNotFound(job_id));
        }
        Ok(self
            .runner
            .run(job_id, None, invocation, &Cancellation::new()))
    }

    /// Set remaining retries. A positive count on an incident job resolves
    /// the incident and makes it acquirable again.
    pub fn set_job_retries(
        &self,
        job_id: JobId,
        retries: u32,
        invocation: InvocationContext,
    ) -> Result<(), CommandError> {
        self.pipeline
            .execute(&SetJobRetriesCommand::new(job_id, retries), invocation)?;
        if retries > 0 {
            self.hint();
        }
        Ok(())
    }

    pub fn suspend_job(
        &self,
        job_id: JobId,
        invocation: InvocationContext,
    ) -> Result<(), CommandError> {
        self.pipeline
            .execute(&SetJobSuspensionCommand::new(job_id, true), invocation)
    }

    pub fn activate_job(
        &self,
        job_id: JobId,
        invocation: InvocationContext,
    ) -> Result<(), CommandError> {
        self.pipeline
            .execute(&SetJobSuspensionCommand::new(job_id, false), invocation)?;
        self.hint();
        Ok(())
    }

    /// Delete a job that is not currently locked.
    pub fn delete_job(
        &self,
        job_id: JobId,
        invocation: InvocationContext,
    ) -> Result<(), CommandError> {
        self.pipeline
            .execute(&DeleteJobCommand::new(job_id), invocation)
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<Job>, CommandError> {
        Ok(self.pipeline.store().find_job(job_id)?)
    }

    pub fn jobs(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, CommandError> {
        let now = self.pipeline.clock().now();
        Ok(self
            .pipeline
            .store()
            .list_jobs(filter, now, self.clock_skew_tolerance, limit)?)
    }

    pub fn incidents(&self, open_only: bool, limit: usize) -> Result<Vec<Incident>, CommandError> {
        Ok(self.pipeline.store().list_incidents(open_only, limit)?)
    }

    /// Every recorded failure of a job, oldest first.
    pub fn failure_log(&self, job_id: JobId) -> Result<Vec<FailureRecord>, CommandError> {
        Ok(self.pipeline.store().failure_log(job_id)?)
    }

    pub fn job_stats(&self) -> Result<JobStats, CommandError> {
        let now = self.pipeline.clock().now();
        Ok(self
            .pipeline
            .store()
            .stats(now, self.clock_skew_tolerance)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;
    use jobflow_core::{Clock, ManualClock};

    use super::*;
    use crate::commands::FailureOutcome;
    use crate::failure::DefaultFailedJobStrategy;
    use crate::handler::JobHandlerRegistry;
    use crate::jobs::{InMemoryJobStore, JobState};

    struct Fixture {
        clock: Arc<ManualClock>,
        handlers: Arc<JobHandlerRegistry>,
        service: ManagementService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryJobStore::arc();
        let handlers = Arc::new(JobHandlerRegistry::new());
        let pipeline = CommandPipeline::builder(store, clock.clone()).build();
        let runner = Arc::new(JobRunner::new(
            pipeline.clone(),
            handlers.clone(),
            Arc::new(DefaultFailedJobStrategy::default()),
            3,
        ));
        Fixture {
            clock,
            handlers,
            service: ManagementService::new(pipeline, runner, None, 3, Duration::zero()),
        }
    }

    fn system() -> InvocationContext {
        InvocationContext::system()
    }

    #[test]
    fn execute_job_runs_regardless_of_due_date() {
        let fx = fixture();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        fx.handlers.register_fn("later", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let id = fx
            .service
            .create_job(
                NewJob::new("later", "").due_at(fx.clock.now() + Duration::hours(1)),
                system(),
            )
            .unwrap();
        let report = fx.service.execute_job(id, system()).unwrap();

        assert!(report.is_completed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(fx.service.job(id).unwrap().is_none());
    }

    #[test]
    fn execute_unknown_job_is_not_found() {
        let fx = fixture();
        let missing = JobId::new();
        assert!(matches!(
            fx.service.execute_job(missing, system()),
            Err(CommandError::JobNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn forced_failure_follows_the_retry_policy_and_retries_resolve_incidents() {
        let fx = fixture();
        fx.handlers
            .register_fn("flaky", |_, _| anyhow::bail!("downstream unavailable"));
        let id = fx
            .service
            .create_job(NewJob::new("flaky", "").with_retries(1), system())
            .unwrap();

        match fx.service.execute_job(id, system()).unwrap() {
            JobRunReport::Failed {
                outcome: Some(FailureOutcome::IncidentRaised(incident)),
                ..
            } => assert_eq!(incident.job_id, id),
            other => panic!("unexpected report {other:?}"),
        }

        let job = fx.service.job(id).unwrap().unwrap();
        assert_eq!(job.retries, 0);
        assert_eq!(job.exception_message.as_deref(), Some("downstream unavailable"));
        assert_eq!(fx.service.incidents(true, 10).unwrap().len(), 1);
        assert_eq!(fx.service.failure_log(id).unwrap().len(), 1);

        fx.service.set_job_retries(id, 2, system()).unwrap();
        assert!(fx.service.incidents(true, 10).unwrap().is_empty());
        let pending = fx.service.jobs(&JobFilter::all().in_state(JobState::Pending), 10);
        assert_eq!(pending.unwrap().len(), 1);
        assert_eq!(fx.service.job_stats().unwrap().executable, 1);
    }

    #[test]
    fn suspended_jobs_are_counted_and_can_be_reactivated() {
        let fx = fixture();
        let id = fx
            .service
            .create_job(NewJob::new("noop", ""), system())
            .unwrap();

        fx.service.suspend_job(id, system()).unwrap();
        let stats = fx.service.job_stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.suspended, 1);
        assert_eq!(stats.executable, 0);

        // Suspension does not change the derived state; filters tell them apart.
        let count = |filter: JobFilter| fx.service.jobs(&filter, 10).unwrap().len();
        assert_eq!(count(JobFilter::all().in_state(JobState::Pending)), 1);
        assert_eq!(count(JobFilter::all().in_state(JobState::Pending).suspended(false)), 0);
        assert_eq!(count(JobFilter::all().executable()), 0);

        fx.service.activate_job(id, system()).unwrap();
        assert_eq!(fx.service.job_stats().unwrap().executable, 1);

        fx.service.delete_job(id, system()).unwrap();
        assert_eq!(fx.service.job_stats().unwrap().total, 0);
    }

    #[test]
    fn blank_handler_type_is_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.service.create_job(NewJob::new("  ", ""), system()),
            Err(CommandError::InvalidArgument(_))
        ));
    }
}
