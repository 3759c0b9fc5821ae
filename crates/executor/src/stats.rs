//! Executor runtime statistics.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Counters since start, plus a snapshot of the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub acquisition_failures: u64,
    /// Cycles that found the dispatcher full or had jobs rejected by it.
    pub backpressure_cycles: u64,
    pub jobs_acquired: u64,
    /// Claimed jobs the dispatcher refused; their locks were released.
    pub jobs_rejected: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Lost races: job gone, lock lost, or suspended after acquisition.
    pub jobs_skipped: u64,
    pub incidents_raised: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

pub(crate) fn record(stats: &Mutex<ExecutorStats>, update: impl FnOnce(&mut ExecutorStats)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    update(&mut guard);
}

pub(crate) fn snapshot(stats: &Mutex<ExecutorStats>) -> ExecutorStats {
    stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
}
