//! Asynchronous job executor for a workflow engine.
//!
//! Jobs live in a shared [`JobStore`]. Each node runs a [`JobExecutor`]: an
//! acquisition thread claims due jobs under a time-bounded lock and hands them
//! to a bounded worker pool. Every job runs as a command through an
//! interceptor pipeline in its own unit of work; failures are recorded in a
//! separate one, with retries, backoff and incidents decided by a
//! [`FailedJobStrategy`].

pub mod acquisition;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod failure;
pub mod handler;
pub mod jobs;
pub mod management;
pub mod pipeline;
pub mod runner;
pub mod stats;


pub use acquisition::{AcquisitionBackoff, AcquisitionHint, AcquisitionState, CycleOutcome};
pub use commands::{ExecutionOutcome, FailureOutcome};
pub use config::{ConfigError, JobExecutorConfig};
pub use dispatcher::{Dispatcher, DispatcherShutdown};
pub use executor::{ExecutorError, JobExecutor, JobExecutorHandle, ShutdownReport};
pub use failure::{
    DefaultFailedJobStrategy, ExponentialBackoffStrategy, FailedJobStrategy, RetryDecision,
};
pub use handler::{Cancellation, JobContext, JobHandler, JobHandlerRegistry};
pub use jobs::{
    ClaimRequest, FailureDetail, FailureRecord, InMemoryJobStore, Incident, Job, JobFilter,
    JobState, JobStats, JobStore, JobStoreError, NewJob, Transaction,
};
#[cfg(feature = "postgres")]
pub use jobs::PostgresJobStore;
pub use management::ManagementService;
pub use pipeline::{
    Command, CommandContext, CommandError, CommandInterceptor, CommandPipeline,
    InvocationContext, interceptor_fn,
};
pub use runner::{JobRunReport, JobRunner};
pub use stats::ExecutorStats;

pub use jobflow_core::{
    Clock, IncidentId, JobId, LockOwner, ManualClock, ProcessInstanceId, RetrySchedule, SystemClock,
};
