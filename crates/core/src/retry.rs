//! Failed-job retry schedules.
//!
//! Two textual forms are accepted:
//!
//! - `R<n>/<duration>`: `n` attempts, each retry delayed by the same duration
//!   (`R5/PT5M`);
//! - `<duration>,<duration>,...`: one attempt per listed delay, consumed in
//!   order (`PT1M,PT5M,PT10M`). Once the list is exhausted the last delay is
//!   reused.

use core::fmt;
use core::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::duration::{format_iso8601_duration, parse_iso8601_duration};
use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RetrySchedule {
    /// Fixed delay, fixed number of attempts.
    Repeating { attempts: u32, interval: Duration },
    /// Explicit delay per attempt.
    Intervals(Vec<Duration>),
}

impl RetrySchedule {
    pub fn repeating(attempts: u32, interval: Duration) -> Self {
        Self::Repeating { attempts, interval }
    }

    pub fn intervals(delays: impl IntoIterator<Item = Duration>) -> Result<Self, CoreError> {
        let delays: Vec<Duration> = delays.into_iter().collect();
        if delays.is_empty() {
            return Err(CoreError::validation("retry interval list must not be empty"));
        }
        Ok(Self::Intervals(delays))
    }

    /// Number of attempts this schedule grants.
    pub fn attempts(&self) -> u32 {
        match self {
            RetrySchedule::Repeating { attempts, .. } => *attempts,
            RetrySchedule::Intervals(delays) => u32::try_from(delays.len()).unwrap_or(u32::MAX),
        }
    }

    /// Longest delay this schedule can produce.
    pub fn longest_delay(&self) -> Duration {
        match self {
            RetrySchedule::Repeating { interval, .. } => *interval,
            RetrySchedule::Intervals(delays) => {
                delays.iter().copied().max().unwrap_or_else(Duration::zero)
            }
        }
    }

    /// Delay before the next attempt, given how many failures were already
    /// recorded before the current one.
    pub fn delay_for(&self, failures_so_far: u32) -> Duration {
        match self {
            RetrySchedule::Repeating { interval, .. } => *interval,
            RetrySchedule::Intervals(delays) => {
                let idx = (failures_so_far as usize).min(delays.len().saturating_sub(1));
                delays.get(idx).copied().unwrap_or_else(Duration::zero)
            }
        }
    }
}

impl FromStr for RetrySchedule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(CoreError::invalid_retry_schedule(s, "empty"));
        }

        if let Some(rest) = input.strip_prefix('R') {
            let (count, interval) = rest.split_once('/').ok_or_else(|| {
                CoreError::invalid_retry_schedule(s, "expected R<n>/<duration>")
            })?;
            let attempts: u32 = count.parse().map_err(|_| {
                CoreError::invalid_retry_schedule(s, format!("bad repetition count '{count}'"))
            })?;
            let interval = parse_iso8601_duration(interval)
                .map_err(|e| CoreError::invalid_retry_schedule(s, e.to_string()))?;
            return Ok(Self::Repeating { attempts, interval });
        }

        let delays = input
            .split(',')
            .map(|part| {
                parse_iso8601_duration(part)
                    .map_err(|e| CoreError::invalid_retry_schedule(s, e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::intervals(delays)
    }
}

impl fmt::Display for RetrySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrySchedule::Repeating { attempts, interval } => {
                write!(f, "R{attempts}/{}", format_iso8601_duration(*interval))
            }
            RetrySchedule::Intervals(delays) => {
                let parts: Vec<String> = delays.iter().map(|d| format_iso8601_duration(*d)).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl TryFrom<String> for RetrySchedule {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RetrySchedule> for String {
    fn from(value: RetrySchedule) -> Self {
        value.to_string()
    }
}
