//! Job acquisition: the background loop that claims due jobs and hands them
//! to the dispatcher.
//!
//! One cycle claims at most `min(max_jobs_per_acquisition, free queue slots)`
//! jobs. The wait before the next cycle depends on what the cycle saw: a full
//! batch polls again at once, an idle store backs off up to `max_wait`, and a
//! full dispatcher waits `backpressure_wait`. A [`AcquisitionHint`] cuts the
//! current wait short.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use jobflow_core::{Clock, JobId, LockOwner};

use crate::config::JobExecutorConfig;
use crate::dispatcher::Dispatcher;
use crate::executor::ExecutorError;
use crate::jobs::{ClaimRequest, JobStore};
use crate::stats::{self, ExecutorStats};

/// Lifecycle of the executor as seen from outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub enum AcquisitionState {
    #[default]
    Stopped,
    Starting,
    Running,
    /// Shutdown requested; no new jobs are claimed.
    Suspending,
}

/// Shared, lock-protected lifecycle cell.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedState(Arc<Mutex<AcquisitionState>>);

impl SharedState {
    pub(crate) fn get(&self) -> AcquisitionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: AcquisitionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// What one acquisition cycle observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Claimed as many jobs as were asked for; more are probably due.
    FullBatch,
    /// Claimed some jobs, fewer than asked for.
    Partial,
    /// Nothing was due.
    Idle,
    /// The dispatcher had no room, or rejected part of the batch.
    Backpressure,
    /// The store failed; treated like an idle cycle.
    StoreError,
}

/// Wait policy between acquisition cycles.
#[derive(Debug, Clone)]
pub struct AcquisitionBackoff {
    base: Duration,
    max_wait: Duration,
    factor: f64,
    backpressure_wait: Duration,
    idle_cycles: u32,
}

impl AcquisitionBackoff {
    pub fn new(base: Duration, max_wait: Duration, factor: f64, backpressure_wait: Duration) -> Self {
        Self {
            base,
            max_wait,
            factor,
            backpressure_wait,
            idle_cycles: 0,
        }
    }

    pub fn from_config(config: &JobExecutorConfig) -> Self {
        Self::new(
            config.acquisition_interval,
            config.max_wait,
            config.wait_increase_factor,
            config.backpressure_wait,
        )
    }

    /// How long to wait after a cycle with `outcome`.
    pub fn next_wait(&mut self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::FullBatch => {
                self.idle_cycles = 0;
                Duration::ZERO
            }
            CycleOutcome::Partial => {
                self.idle_cycles = 0;
                self.base
            }
            CycleOutcome::Backpressure => self.backpressure_wait,
            CycleOutcome::Idle | CycleOutcome::StoreError => {
                let exp = self.factor.powi(self.idle_cycles.min(64) as i32);
                let wait = self.base.as_secs_f64() * exp;
                self.idle_cycles = self.idle_cycles.saturating_add(1);
                if !wait.is_finite() || wait >= self.max_wait.as_secs_f64() {
                    self.max_wait
                } else {
                    Duration::from_secs_f64(wait)
                }
            }
        }
    }

    /// Forget accumulated idle backoff.
    pub fn reset(&mut self) {
        self.idle_cycles = 0;
    }
}

/// Wakes the acquisition loop, e.g. after a job was created that is due now.
#[derive(Debug, Clone)]
pub struct AcquisitionHint(Sender<()>);

impl AcquisitionHint {
    pub fn hint(&self) {
        // A pending wake-up is as good as a new one.
        let _ = self.0.try_send(());
    }
}

pub(crate) struct AcquisitionLoop {
    pub(crate) name: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) lock_owner: LockOwner,
    pub(crate) max_jobs: usize,
    pub(crate) lock_duration: chrono::Duration,
    pub(crate) clock_skew_tolerance: chrono::Duration,
    pub(crate) backoff: AcquisitionBackoff,
    pub(crate) stats: Arc<Mutex<ExecutorStats>>,
}

/// Handle to a running acquisition thread.
#[derive(Debug)]
pub(crate) struct AcquisitionHandle {
    stopping: Arc<AtomicBool>,
    hint: AcquisitionHint,
    join: Option<thread::JoinHandle<()>>,
}

impl AcquisitionHandle {
    pub(crate) fn hint(&self) -> AcquisitionHint {
        self.hint.clone()
    }

    /// Request the loop to stop and wait for it. Idempotent.
    pub(crate) fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.hint.hint();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
    }
}

impl AcquisitionLoop {
    pub(crate) fn spawn(self) -> Result<AcquisitionHandle, ExecutorError> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_name = format!("{}-acquisition", self.name);

        let flag = stopping.clone();
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || self.run(&flag, &wake_rx))
            .map_err(|source| ExecutorError::Spawn {
                name: thread_name,
                source,
            })?;

        Ok(AcquisitionHandle {
            stopping,
            hint: AcquisitionHint(wake_tx),
            join: Some(join),
        })
    }

    fn run(mut self, stopping: &AtomicBool, wake: &Receiver<()>) {
        info!(executor = %self.name, lock_owner = %self.lock_owner, "job acquisition started");

        while !stopping.load(Ordering::Acquire) {
            let outcome = match catch_unwind(AssertUnwindSafe(|| self.cycle())) {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(executor = %self.name, "acquisition cycle panicked");
                    stats::record(&self.stats, |s| s.acquisition_failures += 1);
                    CycleOutcome::StoreError
                }
            };

            let wait = self.backoff.next_wait(outcome);
            debug!(
                executor = %self.name,
                ?outcome,
                wait_ms = wait.as_millis() as u64,
                "acquisition cycle done"
            );

            if stopping.load(Ordering::Acquire) {
                break;
            }
            match wake.recv_timeout(wait) {
                Ok(()) => self.backoff.reset(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(executor = %self.name, "job acquisition stopped");
    }

    pub(crate) fn cycle(&self) -> CycleOutcome {
        stats::record(&self.stats, |s| s.acquisition_cycles += 1);

        let capacity = self.dispatcher.remaining_capacity();
        if capacity == 0 {
            stats::record(&self.stats, |s| s.backpressure_cycles += 1);
            return CycleOutcome::Backpressure;
        }
        let max_jobs = self.max_jobs.min(capacity);

        let request = ClaimRequest {
            max_jobs,
            now: self.clock.now(),
            lock_owner: self.lock_owner.clone(),
            lock_duration: self.lock_duration,
            clock_skew_tolerance: self.clock_skew_tolerance,
        };
        let claimed = match self.store.claim_due_jobs(&request) {
            Ok(ids) => ids,
            Err(err) => {
                warn!(executor = %self.name, error = %err, "failed to acquire jobs");
                stats::record(&self.stats, |s| s.acquisition_failures += 1);
                return CycleOutcome::StoreError;
            }
        };
        let claimed_count = claimed.len();

        let mut rejected: Vec<JobId> = Vec::new();
        for id in claimed {
            if !rejected.is_empty() {
                rejected.push(id);
                continue;
            }
            if let Err(id) = self.dispatcher.try_submit(id) {
                rejected.push(id);
            }
        }

        let accepted = claimed_count - rejected.len();
        stats::record(&self.stats, |s| {
            s.jobs_acquired += accepted as u64;
            s.jobs_rejected += rejected.len() as u64;
        });

        if !rejected.is_empty() {
            debug!(
                executor = %self.name,
                rejected = rejected.len(),
                "dispatcher full; releasing claimed jobs"
            );
            if let Err(err) = self.store.unlock_jobs(&rejected, &self.lock_owner) {
                warn!(
                    executor = %self.name,
                    error = %err,
                    "failed to release rejected jobs; their locks will expire"
                );
            }
            stats::record(&self.stats, |s| s.backpressure_cycles += 1);
            return CycleOutcome::Backpressure;
        }

        match claimed_count {
            0 => CycleOutcome::Idle,
            n if n >= max_jobs => CycleOutcome::FullBatch,
            _ => CycleOutcome::Partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStoreError;

    fn backoff() -> AcquisitionBackoff {
        AcquisitionBackoff::new(
            Duration::from_secs(5),
            Duration::from_secs(60),
            2.0,
            Duration::from_millis(500),
        )
    }

    #[test]
    fn idle_cycles_back_off_exponentially_up_to_max_wait() {
        let mut b = backoff();
        let waits: Vec<u64> = (0..6)
            .map(|_| b.next_wait(CycleOutcome::Idle).as_secs())
            .collect();
        assert_eq!(waits, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn found_jobs_reset_the_backoff() {
        let mut b = backoff();
        b.next_wait(CycleOutcome::Idle);
        b.next_wait(CycleOutcome::Idle);
        assert_eq!(b.next_wait(CycleOutcome::FullBatch), Duration::ZERO);
        assert_eq!(b.next_wait(CycleOutcome::Idle), Duration::from_secs(5));

        b.next_wait(CycleOutcome::Idle);
        assert_eq!(b.next_wait(CycleOutcome::Partial), Duration::from_secs(5));
        assert_eq!(b.next_wait(CycleOutcome::Idle), Duration::from_secs(5));
    }

    #[test]
    fn backpressure_uses_its_own_wait_and_keeps_idle_count() {
        let mut b = backoff();
        b.next_wait(CycleOutcome::Idle);
        assert_eq!(
            b.next_wait(CycleOutcome::Backpressure),
            Duration::from_millis(500)
        );
        assert_eq!(b.next_wait(CycleOutcome::Idle), Duration::from_secs(10));
    }

    #[test]
    fn hint_resets_and_store_errors_count_as_idle() {
        let mut b = backoff();
        b.next_wait(CycleOutcome::StoreError);
        b.next_wait(CycleOutcome::StoreError);
        b.reset();
        assert_eq!(b.next_wait(CycleOutcome::StoreError), Duration::from_secs(5));
    }

    #[test]
    fn cycle_claims_no_more_than_free_queue_slots() {
        use jobflow_core::SystemClock;

        use crate::failure::DefaultFailedJobStrategy;
        use crate::handler::JobHandlerRegistry;
        use crate::jobs::{InMemoryJobStore, JobFilter, JobState, NewJob};
        use crate::pipeline::CommandPipeline;
        use crate::runner::JobRunner;

        let store = InMemoryJobStore::new();
        for _ in 0..5 {
            let mut tx = store.begin().unwrap();
            tx.insert_job(NewJob::new("noop", "").into_job(SystemClock.now(), 3))
                .unwrap();
            tx.commit().unwrap();
        }

        let pipeline =
            CommandPipeline::builder(Arc::new(store.clone()), Arc::new(SystemClock)).build();
        let runner = Arc::new(JobRunner::new(
            pipeline,
            Arc::new(JobHandlerRegistry::new()),
            Arc::new(DefaultFailedJobStrategy::default()),
            3,
        ));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let owner = LockOwner::generate();
        // No workers: whatever is queued stays queued.
        let dispatcher =
            Arc::new(Dispatcher::start("test", 0, 2, runner, owner.clone(), stats.clone()).unwrap());

        let acquisition = AcquisitionLoop {
            name: "test".into(),
            store: Arc::new(store.clone()),
            clock: Arc::new(SystemClock),
            dispatcher: dispatcher.clone(),
            lock_owner: owner,
            max_jobs: 5,
            lock_duration: chrono::Duration::minutes(5),
            clock_skew_tolerance: chrono::Duration::zero(),
            backoff: backoff(),
            stats: stats.clone(),
        };

        assert_eq!(acquisition.cycle(), CycleOutcome::FullBatch);
        assert_eq!(dispatcher.queue_depth(), 2);
        assert_eq!(acquisition.cycle(), CycleOutcome::Backpressure);

        let now = SystemClock.now();
        let locked = store
            .list_jobs(&JobFilter::all().in_state(JobState::Locked), now, chrono::Duration::zero(), 10)
            .unwrap();
        assert_eq!(locked.len(), 2);

        let s = stats::snapshot(&stats);
        assert_eq!(s.acquisition_cycles, 2);
        assert_eq!(s.jobs_acquired, 2);
        assert_eq!(s.backpressure_cycles, 1);
        assert_eq!(dispatcher.shutdown(Duration::from_millis(10)).abandoned.len(), 2);
    }

    /// Fails the first `failures` claims, then behaves like the wrapped store.
    struct FlakyStore {
        inner: crate::jobs::InMemoryJobStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    impl JobStore for FlakyStore {
        fn claim_due_jobs(&self, request: &ClaimRequest) -> Result<Vec<JobId>, JobStoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.claim_due_jobs(request)
        }

        fn unlock_jobs(&self, ids: &[JobId], owner: &LockOwner) -> Result<(), JobStoreError> {
            self.inner.unlock_jobs(ids, owner)
        }

        fn begin(&self) -> Result<Box<dyn crate::jobs::Transaction>, JobStoreError> {
            self.inner.begin()
        }

        fn find_job(&self, id: JobId) -> Result<Option<crate::jobs::Job>, JobStoreError> {
            self.inner.find_job(id)
        }

        fn list_jobs(
            &self,
            filter: &crate::jobs::JobFilter,
            now: chrono::DateTime<chrono::Utc>,
            clock_skew_tolerance: chrono::Duration,
            limit: usize,
        ) -> Result<Vec<crate::jobs::Job>, JobStoreError> {
            self.inner.list_jobs(filter, now, clock_skew_tolerance, limit)
        }

        fn list_incidents(
            &self,
            open_only: bool,
            limit: usize,
        ) -> Result<Vec<crate::jobs::Incident>, JobStoreError> {
            self.inner.list_incidents(open_only, limit)
        }

        fn failure_log(&self, id: JobId) -> Result<Vec<crate::jobs::FailureRecord>, JobStoreError> {
            self.inner.failure_log(id)
        }

        fn stats(
            &self,
            now: chrono::DateTime<chrono::Utc>,
            clock_skew_tolerance: chrono::Duration,
        ) -> Result<crate::jobs::JobStats, JobStoreError> {
            self.inner.stats(now, clock_skew_tolerance)
        }
    }

    fn flaky_loop(
        failures: usize,
        workers: usize,
    ) -> (Arc<FlakyStore>, JobId, Arc<Dispatcher>, AcquisitionLoop) {
        use jobflow_core::SystemClock;

        use crate::failure::DefaultFailedJobStrategy;
        use crate::handler::JobHandlerRegistry;
        use crate::jobs::{InMemoryJobStore, NewJob};
        use crate::pipeline::CommandPipeline;
        use crate::runner::JobRunner;

        let inner = InMemoryJobStore::new();
        let job = NewJob::new("noop", "").into_job(SystemClock.now(), 3);
        let id = job.id;
        let mut tx = inner.begin().unwrap();
        tx.insert_job(job).unwrap();
        tx.commit().unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures: std::sync::atomic::AtomicUsize::new(failures),
        });

        let handlers = Arc::new(JobHandlerRegistry::new());
        handlers.register_fn("noop", |_, _| Ok(()));
        let pipeline = CommandPipeline::builder(store.clone(), Arc::new(SystemClock)).build();
        let runner = Arc::new(JobRunner::new(
            pipeline,
            handlers,
            Arc::new(DefaultFailedJobStrategy::default()),
            3,
        ));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let owner = LockOwner::generate();
        let dispatcher = Arc::new(
            Dispatcher::start("flaky", workers, 4, runner, owner.clone(), stats.clone()).unwrap(),
        );

        let acquisition = AcquisitionLoop {
            name: "flaky".into(),
            store: store.clone(),
            clock: Arc::new(SystemClock),
            dispatcher: dispatcher.clone(),
            lock_owner: owner,
            max_jobs: 3,
            lock_duration: chrono::Duration::minutes(5),
            clock_skew_tolerance: chrono::Duration::zero(),
            backoff: AcquisitionBackoff::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
                2.0,
                Duration::from_millis(5),
            ),
            stats,
        };
        (store, id, dispatcher, acquisition)
    }

    #[test]
    fn store_errors_back_off_and_acquisition_recovers() {
        let (_store, id, dispatcher, acquisition) = flaky_loop(3, 0);
        let mut backoff = acquisition.backoff.clone();

        let mut waits = Vec::new();
        for _ in 0..3 {
            let outcome = acquisition.cycle();
            assert_eq!(outcome, CycleOutcome::StoreError);
            waits.push(backoff.next_wait(outcome).as_millis());
        }
        assert_eq!(waits, vec![10, 20, 40]);
        assert_eq!(stats::snapshot(&acquisition.stats).acquisition_failures, 3);

        assert_eq!(acquisition.cycle(), CycleOutcome::Partial);
        assert_eq!(backoff.next_wait(CycleOutcome::Partial).as_millis(), 10);
        let s = stats::snapshot(&acquisition.stats);
        assert_eq!(s.acquisition_failures, 3);
        assert_eq!(s.jobs_acquired, 1);
        assert_eq!(dispatcher.shutdown(Duration::from_millis(10)).abandoned, vec![id]);
    }

    #[test]
    fn running_loop_survives_store_outage() {
        let (store, id, dispatcher, acquisition) = flaky_loop(3, 1);
        let stats = acquisition.stats.clone();
        let mut handle = acquisition.spawn().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.find_job(id).unwrap().is_some() {
            assert!(std::time::Instant::now() < deadline, "job never ran after the outage");
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        dispatcher.shutdown(Duration::from_secs(1));

        let s = stats::snapshot(&stats);
        assert_eq!(s.acquisition_failures, 3);
        assert_eq!(s.jobs_succeeded, 1);
    }

    #[test]
    fn hints_coalesce() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let hint = AcquisitionHint(tx);
        hint.hint();
        hint.hint();
        assert_eq!(rx.try_iter().count(), 1);
    }
}
