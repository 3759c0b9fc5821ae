//! `jobflow-core`: building blocks shared by the job executor.
//!
//! This crate contains **no IO and no threads**: identifiers, the core error
//! type, the injectable clock and the parsing of ISO-8601 durations and
//! failed-job retry schedules.

pub mod clock;
pub mod duration;
pub mod error;
pub mod id;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock, saturating_add};
pub use duration::{
    MAX_DURATION_MS, format_iso8601_duration, max_duration, parse_iso8601_duration,
};
pub use error::{CoreError, CoreResult};
pub use id::{IncidentId, JobId, LockOwner, ProcessInstanceId};
pub use retry::RetrySchedule;
