//! Bounded dispatch queue and worker pool.
//!
//! Acquisition offers claimed job ids with [`Dispatcher::try_submit`]; it never
//! blocks. A full queue is backpressure: the offer is rejected and the caller
//! releases the claim. Workers pull ids and run them through the
//! [`JobRunner`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use jobflow_core::{JobId, LockOwner};

use crate::executor::ExecutorError;
use crate::handler::Cancellation;
use crate::pipeline::InvocationContext;
use crate::runner::JobRunner;
use crate::stats::{self, ExecutorStats};

/// How often idle workers re-check the stop flag.
const WORKER_POLL: Duration = Duration::from_millis(50);

struct WorkerShared {
    stopping: AtomicBool,
    in_flight: AtomicUsize,
    cancellation: Cancellation,
}

/// Result of a dispatcher shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherShutdown {
    /// Queued ids that were never executed. Their locks expire normally.
    pub abandoned: Vec<JobId>,
    /// Workers still busy when the grace period ran out; they were cancelled
    /// and detached.
    pub unfinished_workers: usize,
}

/// Bounded queue plus a fixed pool of worker threads.
pub struct Dispatcher {
    name: String,
    sender: Sender<JobId>,
    receiver: Receiver<JobId>,
    capacity: usize,
    shared: Arc<WorkerShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    done: Receiver<usize>,
}

impl Dispatcher {
    pub fn start(
        name: &str,
        pool_size: usize,
        queue_size: usize,
        runner: Arc<JobRunner>,
        lock_owner: LockOwner,
        stats: Arc<Mutex<ExecutorStats>>,
    ) -> Result<Self, ExecutorError> {
        let (sender, receiver) = crossbeam_channel::bounded(queue_size.max(1));
        let (done_tx, done) = crossbeam_channel::unbounded();
        let shared = Arc::new(WorkerShared {
            stopping: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            cancellation: Cancellation::new(),
        });

        let mut workers = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let thread_name = format!("{name}-worker-{index}");
            let worker = Worker {
                index,
                receiver: receiver.clone(),
                runner: runner.clone(),
                lock_owner: lock_owner.clone(),
                shared: shared.clone(),
                stats: stats.clone(),
                done: done_tx.clone(),
            };
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    shared.stopping.store(true, Ordering::Release);
                    return Err(ExecutorError::Spawn {
                        name: thread_name,
                        source,
                    });
                }
            }
        }

        info!(
            executor = %name,
            workers = pool_size,
            queue_size,
            "dispatcher started"
        );

        Ok(Self {
            name: name.to_string(),
            sender,
            receiver,
            capacity: queue_size.max(1),
            shared,
            workers: Mutex::new(workers),
            done,
        })
    }

    /// Offer a job id without blocking. Returns the id back if the queue is
    /// full or the dispatcher is stopping.
    pub fn try_submit(&self, job_id: JobId) -> Result<(), JobId> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(job_id);
        }
        match self.sender.try_send(job_id) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(id)) | Err(TrySendError::Disconnected(id)) => Err(id),
        }
    }

    /// Free queue slots right now.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.sender.len())
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Stop pulling, wait up to `grace` for workers to finish their current
    /// job, then cancel and detach the rest. Idempotent.
    pub fn shutdown(&self, grace: Duration) -> DispatcherShutdown {
        self.shared.stopping.store(true, Ordering::Release);

        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let mut finished = vec![false; workers.len()];
        let mut remaining = workers.len();
        let deadline = Instant::now() + grace;

        while remaining > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(left) {
                Ok(index) => {
                    if let Some(slot) = finished.get_mut(index) {
                        if !*slot {
                            *slot = true;
                            remaining -= 1;
                        }
                    }
                }
                Err(_) => break,
            }
        }

        if remaining > 0 {
            self.shared.cancellation.cancel();
            warn!(
                executor = %self.name,
                unfinished = remaining,
                "grace period elapsed; cancelling and detaching busy workers"
            );
        }

        for (handle, done) in workers.into_iter().zip(&finished) {
            if *done && handle.join().is_err() {
                error!(executor = %self.name, "worker thread panicked");
            }
        }

        let abandoned: Vec<JobId> = self.receiver.try_iter().collect();
        if !abandoned.is_empty() {
            debug!(
                executor = %self.name,
                abandoned = abandoned.len(),
                "queued jobs abandoned; their locks will expire"
            );
        }

        DispatcherShutdown {
            abandoned,
            unfinished_workers: remaining,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("queue_depth", &self.queue_depth())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct Worker {
    index: usize,
    receiver: Receiver<JobId>,
    runner: Arc<JobRunner>,
    lock_owner: LockOwner,
    shared: Arc<WorkerShared>,
    stats: Arc<Mutex<ExecutorStats>>,
    done: Sender<usize>,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.index, "worker started");

        while !self.shared.stopping.load(Ordering::Acquire) {
            let job_id = match self.receiver.recv_timeout(WORKER_POLL) {
                Ok(id) => id,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            let report = catch_unwind(AssertUnwindSafe(|| {
                self.runner.run(
                    job_id,
                    Some(&self.lock_owner),
                    InvocationContext::system(),
                    &self.shared.cancellation,
                )
            }));
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);

            match report {
                Ok(report) => stats::record(&self.stats, |s| report.record_into(s)),
                Err(_) => {
                    error!(job_id = %job_id, "job runner panicked");
                    stats::record(&self.stats, |s| s.jobs_failed += 1);
                }
            }
        }

        debug!(worker = self.index, "worker stopped");
        let _ = self.done.send(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use jobflow_core::{Clock, SystemClock};

    use super::*;
    use crate::failure::DefaultFailedJobStrategy;
    use crate::handler::JobHandlerRegistry;
    use crate::jobs::{ClaimRequest, InMemoryJobStore, JobStore, NewJob};
    use crate::pipeline::CommandPipeline;

    fn runner(store: &InMemoryJobStore, handlers: Arc<JobHandlerRegistry>) -> Arc<JobRunner> {
        let pipeline =
            CommandPipeline::builder(Arc::new(store.clone()), Arc::new(SystemClock)).build();
        Arc::new(JobRunner::new(
            pipeline,
            handlers,
            Arc::new(DefaultFailedJobStrategy::default()),
            3,
        ))
    }

    fn claim_all(store: &InMemoryJobStore, owner: &LockOwner) -> Vec<JobId> {
        store
            .claim_due_jobs(&ClaimRequest {
                max_jobs: 100,
                now: SystemClock.now(),
                lock_owner: owner.clone(),
                lock_duration: chrono::Duration::minutes(5),
                clock_skew_tolerance: chrono::Duration::zero(),
            })
            .unwrap()
    }

    fn seed(store: &InMemoryJobStore, n: usize, handler_type: &str) {
        for _ in 0..n {
            let mut tx = store.begin().unwrap();
            tx.insert_job(NewJob::new(handler_type, "").into_job(SystemClock.now(), 3))
                .unwrap();
            tx.commit().unwrap();
        }
    }

    #[test]
    fn rejects_when_full_and_abandons_queue_on_shutdown() {
        let store = InMemoryJobStore::new();
        let handlers = Arc::new(JobHandlerRegistry::new());
        let gate = Arc::new(Barrier::new(2));
        let worker_gate = gate.clone();
        handlers.register_fn("block", move |_, _| {
            worker_gate.wait();
            worker_gate.wait();
            Ok(())
        });
        seed(&store, 4, "block");
        let owner = LockOwner::generate();
        let ids = claim_all(&store, &owner);

        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let dispatcher = Dispatcher::start(
            "test",
            1,
            2,
            runner(&store, handlers),
            owner.clone(),
            stats.clone(),
        )
        .unwrap();

        dispatcher.try_submit(ids[0]).unwrap();
        gate.wait(); // worker is now inside the handler
        assert_eq!(dispatcher.in_flight(), 1);

        dispatcher.try_submit(ids[1]).unwrap();
        dispatcher.try_submit(ids[2]).unwrap();
        assert_eq!(dispatcher.remaining_capacity(), 0);
        assert_eq!(dispatcher.try_submit(ids[3]), Err(ids[3]));

        // Let the running job finish only after shutdown was requested.
        let release = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.wait();
            })
        };
        let outcome = dispatcher.shutdown(Duration::from_secs(5));
        release.join().unwrap();

        assert_eq!(outcome.unfinished_workers, 0);
        assert_eq!(outcome.abandoned, vec![ids[1], ids[2]]);
        assert_eq!(stats::snapshot(&stats).jobs_succeeded, 1);
        assert!(store.find_job(ids[0]).unwrap().is_none());
        assert!(store.find_job(ids[1]).unwrap().is_some());
        assert_eq!(dispatcher.try_submit(ids[3]), Err(ids[3]));
    }

    #[test]
    fn grace_period_cancels_busy_workers() {
        let store = InMemoryJobStore::new();
        let handlers = Arc::new(JobHandlerRegistry::new());
        handlers.register_fn("cooperative", |_, ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            anyhow::bail!("cancelled")
        });
        seed(&store, 1, "cooperative");
        let owner = LockOwner::generate();
        let ids = claim_all(&store, &owner);

        let dispatcher = Dispatcher::start(
            "test",
            1,
            1,
            runner(&store, handlers),
            owner,
            Arc::new(Mutex::new(ExecutorStats::default())),
        )
        .unwrap();
        dispatcher.try_submit(ids[0]).unwrap();
        while dispatcher.in_flight() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let outcome = dispatcher.shutdown(Duration::from_millis(50));
        assert_eq!(outcome.unfinished_workers, 1);
        assert!(outcome.abandoned.is_empty());
    }
}
