//! Persisted jobs and the stores that hold them.
//!
//! ## Components
//!
//! - `Job`: the persisted unit of work, with lock, retry and exception fields
//! - `JobStore` / `Transaction`: the storage contract used by acquisition and
//!   by every command
//! - `InMemoryJobStore`: staged, optimistically versioned in-memory store
//! - `PostgresJobStore` (feature `postgres`): durable store using
//!   `FOR UPDATE SKIP LOCKED` for acquisition

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod types;

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use store::{ClaimRequest, JobFilter, JobStats, JobStore, JobStoreError, Transaction};
pub use types::{
    DEFAULT_RETRIES, FAILED_JOB_INCIDENT_TYPE, FailureDetail, FailureRecord, Incident, Job,
    JobState, NewJob,
};
