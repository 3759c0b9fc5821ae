//! Executor configuration.
//!
//! Values come from code (`Default` + builder methods), from serde (any
//! format the caller deserializes; durations in milliseconds) or from
//! `JOBFLOW_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobflow_core::{LockOwner, MAX_DURATION_MS, RetrySchedule, max_duration};

use crate::failure::DefaultFailedJobStrategy;
use crate::jobs::DEFAULT_RETRIES;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Name for logging and thread names.
    pub name: String,
    /// Lock owner written into claimed jobs; generated when unset.
    pub lock_owner: Option<String>,
    /// Wait between acquisition cycles when the last batch was partial.
    #[serde(with = "duration_ms")]
    pub acquisition_interval: Duration,
    pub max_jobs_per_acquisition: usize,
    /// How long a claimed job stays locked.
    #[serde(with = "duration_ms")]
    pub lock_duration: Duration,
    pub worker_pool_size: usize,
    pub queue_size: usize,
    /// Executor-wide retry delays, used when a job has no schedule of its own.
    pub backoff_sequence: Option<RetrySchedule>,
    #[serde(with = "duration_ms")]
    pub default_retry_delay: Duration,
    /// Retries given to jobs created without an explicit count.
    pub max_retries_default: u32,
    /// Upper bound of the idle wait.
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Growth factor of the idle wait per empty cycle.
    pub wait_increase_factor: f64,
    /// Wait after the dispatcher rejected work.
    #[serde(with = "duration_ms")]
    pub backpressure_wait: Duration,
    #[serde(with = "duration_ms")]
    pub shutdown_grace_period: Duration,
    /// A foreign lock only counts as expired once it is this far in the past.
    #[serde(with = "duration_ms")]
    pub clock_skew_tolerance: Duration,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            lock_owner: None,
            acquisition_interval: Duration::from_millis(5_000),
            max_jobs_per_acquisition: 3,
            lock_duration: Duration::from_millis(300_000),
            worker_pool_size: 3,
            queue_size: 3,
            backoff_sequence: None,
            default_retry_delay: Duration::from_secs(10),
            max_retries_default: DEFAULT_RETRIES,
            max_wait: Duration::from_secs(60),
            wait_increase_factor: 2.0,
            backpressure_wait: Duration::from_millis(500),
            shutdown_grace_period: Duration::from_secs(30),
            clock_skew_tolerance: Duration::ZERO,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    pub fn with_acquisition_interval(mut self, interval: Duration) -> Self {
        self.acquisition_interval = interval;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn with_backoff_sequence(mut self, schedule: RetrySchedule) -> Self {
        self.backoff_sequence = Some(schedule);
        self
    }

    pub fn with_default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_retry_delay = delay;
        self
    }

    pub fn with_max_retries_default(mut self, retries: u32) -> Self {
        self.max_retries_default = retries;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    pub fn with_backpressure_wait(mut self, wait: Duration) -> Self {
        self.backpressure_wait = wait;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    /// Defaults overridden by `JOBFLOW_*` environment variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("JOBFLOW_NAME") {
            cfg.name = v;
        }
        if let Some(v) = get("JOBFLOW_LOCK_OWNER") {
            cfg.lock_owner = Some(v);
        }
        if let Some(v) = get("JOBFLOW_ACQUISITION_INTERVAL_MS") {
            cfg.acquisition_interval = parse_millis("JOBFLOW_ACQUISITION_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("JOBFLOW_MAX_JOBS_PER_ACQUISITION") {
            cfg.max_jobs_per_acquisition = parse_num("JOBFLOW_MAX_JOBS_PER_ACQUISITION", &v)?;
        }
        if let Some(v) = get("JOBFLOW_LOCK_DURATION_MS") {
            cfg.lock_duration = parse_millis("JOBFLOW_LOCK_DURATION_MS", &v)?;
        }
        if let Some(v) = get("JOBFLOW_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = parse_num("JOBFLOW_WORKER_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("JOBFLOW_QUEUE_SIZE") {
            cfg.queue_size = parse_num("JOBFLOW_QUEUE_SIZE", &v)?;
        }
        if let Some(v) = get("JOBFLOW_BACKOFF_SEQUENCE") {
            cfg.backoff_sequence = Some(v.parse().map_err(|e: jobflow_core::CoreError| {
                ConfigError::InvalidValue {
                    key: "JOBFLOW_BACKOFF_SEQUENCE",
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?);
        }
        if let Some(v) = get("JOBFLOW_DEFAULT_RETRY_DELAY_MS") {
            cfg.default_retry_delay = parse_millis("JOBFLOW_DEFAULT_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("JOBFLOW_MAX_RETRIES_DEFAULT") {
            cfg.max_retries_default = parse_num("JOBFLOW_MAX_RETRIES_DEFAULT", &v)?;
        }
        if let Some(v) = get("JOBFLOW_MAX_WAIT_MS") {
            cfg.max_wait = parse_millis("JOBFLOW_MAX_WAIT_MS", &v)?;
        }
        if let Some(v) = get("JOBFLOW_WAIT_INCREASE_FACTOR") {
            cfg.wait_increase_factor = parse_num("JOBFLOW_WAIT_INCREASE_FACTOR", &v)?;
        }
        if let Some(v) = get("JOBFLOW_BACKPRESSURE_WAIT_MS") {
            cfg.backpressure_wait = parse_millis("JOBFLOW_BACKPRESSURE_WAIT_MS", &v)?;
        }
        if let Some(v) = get("JOBFLOW_SHUTDOWN_GRACE_PERIOD_MS") {
            cfg.shutdown_grace_period = parse_millis("JOBFLOW_SHUTDOWN_GRACE_PERIOD_MS", &v)?;
        }
        if let Some(v) = get("JOBFLOW_CLOCK_SKEW_TOLERANCE_MS") {
            cfg.clock_skew_tolerance = parse_millis("JOBFLOW_CLOCK_SKEW_TOLERANCE_MS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name must not be empty"));
        }
        if let Some(owner) = &self.lock_owner {
            if owner.trim().is_empty() {
                return Err(ConfigError::invalid("lock owner must not be blank"));
            }
        }
        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::invalid("max_jobs_per_acquisition must be at least 1"));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::invalid("worker_pool_size must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid("queue_size must be at least 1"));
        }
        if self.acquisition_interval.is_zero() {
            return Err(ConfigError::invalid("acquisition_interval must be positive"));
        }
        if self.lock_duration.is_zero() {
            return Err(ConfigError::invalid("lock_duration must be positive"));
        }
        if self.lock_duration <= self.clock_skew_tolerance {
            return Err(ConfigError::invalid(
                "lock_duration must exceed clock_skew_tolerance",
            ));
        }
        for (key, value) in [
            ("lock_duration", self.lock_duration),
            ("clock_skew_tolerance", self.clock_skew_tolerance),
            ("default_retry_delay", self.default_retry_delay),
        ] {
            if value.as_millis() > MAX_DURATION_MS as u128 {
                return Err(ConfigError::invalid(format!("{key} must not exceed 100 years")));
            }
        }
        if let Some(schedule) = &self.backoff_sequence {
            if schedule.longest_delay() > max_duration() {
                return Err(ConfigError::invalid(
                    "backoff_sequence delays must not exceed 100 years",
                ));
            }
        }
        if self.max_wait < self.acquisition_interval {
            return Err(ConfigError::invalid(
                "max_wait must not be shorter than acquisition_interval",
            ));
        }
        if !self.wait_increase_factor.is_finite() || self.wait_increase_factor < 1.0 {
            return Err(ConfigError::invalid("wait_increase_factor must be >= 1"));
        }
        Ok(())
    }

    /// The configured lock owner, or a freshly generated one.
    pub fn resolve_lock_owner(&self) -> Result<LockOwner, ConfigError> {
        match &self.lock_owner {
            Some(owner) => LockOwner::new(owner.clone()).map_err(|e| ConfigError::InvalidValue {
                key: "lock_owner",
                value: owner.clone(),
                reason: e.to_string(),
            }),
            None => Ok(LockOwner::generate()),
        }
    }

    pub fn failed_job_strategy(&self) -> DefaultFailedJobStrategy {
        DefaultFailedJobStrategy::new(
            self.backoff_sequence.clone(),
            to_chrono(self.default_retry_delay),
        )
    }

    pub(crate) fn lock_duration_chrono(&self) -> chrono::Duration {
        to_chrono(self.lock_duration)
    }

    pub(crate) fn clock_skew_chrono(&self) -> chrono::Duration {
        to_chrono(self.clock_skew_tolerance)
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn parse_num<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_num::<u64>(key, value).map(Duration::from_millis)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
