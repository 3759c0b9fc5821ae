//! The job executor: wires store, pipeline, dispatcher and acquisition
//! together and owns their lifecycle.
//!
//! ```text
//! JobExecutor (config, handlers, interceptors)
//!     └─ spawn() ─> JobExecutorHandle
//!                      ├─ acquisition thread ── claim ──> Dispatcher queue
//!                      └─ worker pool <──────────────────┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use jobflow_core::{Clock, JobId, LockOwner, SystemClock};

use crate::acquisition::{
    AcquisitionBackoff, AcquisitionHandle, AcquisitionHint, AcquisitionLoop, AcquisitionState,
    SharedState,
};
use crate::config::{ConfigError, JobExecutorConfig};
use crate::dispatcher::Dispatcher;
use crate::failure::FailedJobStrategy;
use crate::handler::{JobContext, JobHandler, JobHandlerRegistry};
use crate::jobs::JobStore;
use crate::management::ManagementService;
use crate::pipeline::{CommandInterceptor, CommandPipeline};
use crate::runner::JobRunner;
use crate::stats::{self, ExecutorStats};

/// Errors starting the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Summary of a shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs that were queued but never started. They stay locked until their
    /// lock expires, then any node may acquire them.
    pub abandoned_jobs: Vec<JobId>,
    /// Workers still running a job when the grace period ended.
    pub unfinished_workers: usize,
}

/// A configured, not yet running executor.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    config: JobExecutorConfig,
    clock: Arc<dyn Clock>,
    strategy: Option<Arc<dyn FailedJobStrategy>>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    handlers: Arc<JobHandlerRegistry>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, config: JobExecutorConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            strategy: None,
            interceptors: Vec::new(),
            handlers: Arc::new(JobHandlerRegistry::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default failure policy built from the configuration.
    pub fn with_failed_job_strategy(mut self, strategy: Arc<dyn FailedJobStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Add a user interceptor. User interceptors run inside logging and
    /// outside the transaction, in registration order.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn register<H>(&self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.register(pattern, handler);
    }

    pub fn register_handler<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&str, &mut JobContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register_fn(pattern, handler);
    }

    pub fn handlers(&self) -> &Arc<JobHandlerRegistry> {
        &self.handlers
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    fn pipeline(&self) -> CommandPipeline {
        CommandPipeline::builder(self.store.clone(), self.clock.clone())
            .interceptors(self.interceptors.iter().cloned())
            .build()
    }

    fn runner(&self, pipeline: CommandPipeline) -> Arc<JobRunner> {
        let strategy = self
            .strategy
            .clone()
            .unwrap_or_else(|| Arc::new(self.config.failed_job_strategy()));
        Arc::new(JobRunner::new(
            pipeline,
            self.handlers.clone(),
            strategy,
            self.config.max_retries_default,
        ))
    }

    /// Management operations without a running executor. Newly due jobs are
    /// picked up on the next regular acquisition cycle of whichever node runs.
    pub fn management(&self) -> ManagementService {
        let pipeline = self.pipeline();
        let runner = self.runner(pipeline.clone());
        ManagementService::new(
            pipeline,
            runner,
            None,
            self.config.max_retries_default,
            self.config.clock_skew_chrono(),
        )
    }

    /// Validate the configuration and start acquisition and workers.
    pub fn spawn(self) -> Result<JobExecutorHandle, ExecutorError> {
        self.config.validate()?;
        let lock_owner = self.config.resolve_lock_owner()?;

        let state = SharedState::default();
        state.set(AcquisitionState::Starting);

        let pipeline = self.pipeline();
        let runner = self.runner(pipeline.clone());
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let dispatcher = match Dispatcher::start(
            &self.config.name,
            self.config.worker_pool_size,
            self.config.queue_size,
            runner.clone(),
            lock_owner.clone(),
            stats.clone(),
        ) {
            Ok(dispatcher) => Arc::new(dispatcher),
            Err(err) => {
                state.set(AcquisitionState::Stopped);
                return Err(err);
            }
        };

        let acquisition = AcquisitionLoop {
            name: self.config.name.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            dispatcher: dispatcher.clone(),
            lock_owner: lock_owner.clone(),
            max_jobs: self.config.max_jobs_per_acquisition,
            lock_duration: self.config.lock_duration_chrono(),
            clock_skew_tolerance: self.config.clock_skew_chrono(),
            backoff: AcquisitionBackoff::from_config(&self.config),
            stats: stats.clone(),
        };
        let acquisition = match acquisition.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                dispatcher.shutdown(self.config.shutdown_grace_period);
                state.set(AcquisitionState::Stopped);
                return Err(err);
            }
        };
        state.set(AcquisitionState::Running);

        info!(
            executor = %self.config.name,
            lock_owner = %lock_owner,
            workers = self.config.worker_pool_size,
            queue_size = self.config.queue_size,
            "job executor started"
        );

        let management = ManagementService::new(
            pipeline,
            runner,
            Some(acquisition.hint()),
            self.config.max_retries_default,
            self.config.clock_skew_chrono(),
        );

        Ok(JobExecutorHandle {
            config: self.config,
            lock_owner,
            handlers: self.handlers,
            management,
            dispatcher,
            acquisition,
            state,
            stats,
            started_at: Instant::now(),
            report: None,
        })
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// A running executor. Dropping the handle shuts it down.
#[derive(Debug)]
pub struct JobExecutorHandle {
    config: JobExecutorConfig,
    lock_owner: LockOwner,
    handlers: Arc<JobHandlerRegistry>,
    management: ManagementService,
    dispatcher: Arc<Dispatcher>,
    acquisition: AcquisitionHandle,
    state: SharedState,
    stats: Arc<Mutex<ExecutorStats>>,
    started_at: Instant,
    report: Option<ShutdownReport>,
}

impl JobExecutorHandle {
    pub fn state(&self) -> AcquisitionState {
        self.state.get()
    }

    pub fn lock_owner(&self) -> &LockOwner {
        &self.lock_owner
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Wake acquisition now instead of after the current wait.
    pub fn hint(&self) {
        self.acquisition.hint().hint();
    }

    pub fn acquisition_hint(&self) -> AcquisitionHint {
        self.acquisition.hint()
    }

    pub fn management(&self) -> &ManagementService {
        &self.management
    }

    /// Handlers can be added or removed while running.
    pub fn handlers(&self) -> &Arc<JobHandlerRegistry> {
        &self.handlers
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut snapshot = stats::snapshot(&self.stats);
        snapshot.queue_depth = self.dispatcher.queue_depth();
        snapshot.in_flight = self.dispatcher.in_flight();
        snapshot.uptime_secs = self.started_at.elapsed().as_secs();
        snapshot
    }

    /// Stop acquisition, let workers finish within the grace period and
    /// return what was left behind.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop()
    }

    fn stop(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        self.state.set(AcquisitionState::Suspending);
        info!(executor = %self.config.name, "job executor stopping");

        self.acquisition.stop();
        let outcome = self.dispatcher.shutdown(self.config.shutdown_grace_period);
        if outcome.unfinished_workers > 0 {
            warn!(
                executor = %self.config.name,
                unfinished = outcome.unfinished_workers,
                "shutdown grace period exceeded"
            );
        }

        self.state.set(AcquisitionState::Stopped);
        info!(
            executor = %self.config.name,
            abandoned = outcome.abandoned.len(),
            "job executor stopped"
        );

        let report = ShutdownReport {
            abandoned_jobs: outcome.abandoned,
            unfinished_workers: outcome.unfinished_workers,
        };
        self.report = Some(report.clone());
        report
    }
}

impl Drop for JobExecutorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::jobs::InMemoryJobStore;

    fn fast_config() -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("unit")
            .with_acquisition_interval(Duration::from_millis(10))
            .with_max_wait(Duration::from_millis(50))
            .with_shutdown_grace_period(Duration::from_secs(5))
    }

    #[test]
    fn invalid_config_is_rejected_at_spawn() {
        let executor = JobExecutor::new(
            InMemoryJobStore::arc(),
            fast_config().with_worker_pool_size(0),
        );
        assert!(matches!(
            executor.spawn(),
            Err(ExecutorError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn lifecycle_runs_and_stops() {
        let executor = JobExecutor::new(InMemoryJobStore::arc(), fast_config().with_lock_owner("node-a"));
        let handle = executor.spawn().unwrap();
        assert_eq!(handle.state(), AcquisitionState::Running);
        assert_eq!(handle.lock_owner().as_str(), "node-a");

        let report = handle.shutdown();
        assert!(report.abandoned_jobs.is_empty());
        assert_eq!(report.unfinished_workers, 0);
    }

    #[test]
    fn stats_count_acquisition_cycles() {
        let executor = JobExecutor::new(InMemoryJobStore::arc(), fast_config());
        let handle = executor.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let stats = handle.stats();
        assert!(stats.acquisition_cycles >= 1);
        assert_eq!(stats.jobs_acquired, 0);
        drop(handle);
    }
}
