//! Job handlers and their registry.
//!
//! A handler is looked up by the job's `handler_type`: exact match first, then
//! the longest matching category pattern (`"mail.*"` matches `"mail.send"`),
//! then the catch-all `"*"`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use jobflow_core::JobId;

use crate::jobs::{Job, NewJob};
use crate::pipeline::{CommandContext, CommandError, InvocationContext};

/// Executes jobs of one type.
///
/// Returning an error (or panicking) marks the attempt as failed; the unit of
/// work is rolled back and the failure policy decides about retries.
pub trait JobHandler: Send + Sync {
    fn execute(&self, configuration: &str, ctx: &mut JobContext<'_>) -> anyhow::Result<()>;
}

/// Handler backed by a closure.
pub struct FnHandler<F>(F);

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&str, &mut JobContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, configuration: &str, ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
        (self.0)(configuration, ctx)
    }
}

/// Cooperative cancellation flag, raised when shutdown gives up waiting.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a handler can see and do while executing a job.
pub struct JobContext<'a> {
    job: &'a Job,
    command: &'a mut CommandContext,
    cancellation: &'a Cancellation,
    default_retries: u32,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        job: &'a Job,
        command: &'a mut CommandContext,
        cancellation: &'a Cancellation,
        default_retries: u32,
    ) -> Self {
        Self {
            job,
            command,
            cancellation,
            default_retries,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.command.now()
    }

    pub fn invocation(&self) -> &InvocationContext {
        self.command.invocation()
    }

    /// Long-running handlers should poll this and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Create a follow-up job in the same unit of work. It is discarded if
    /// this execution fails.
    pub fn schedule(&mut self, job: NewJob) -> Result<JobId, CommandError> {
        let job = job.into_job(self.command.now(), self.default_retries);
        let id = job.id;
        self.command.transaction()?.insert_job(job)?;
        Ok(id)
    }
}

/// Open registry of handlers, keyed by handler type or pattern.
///
/// Handlers may be added or removed while the executor is running.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.into(), Arc::new(handler));
    }

    /// Register a closure handler.
    pub fn register_fn<F>(&self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&str, &mut JobContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, FnHandler(handler));
    }

    pub fn unregister(&self, pattern: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pattern)
            .is_some()
    }

    /// Resolve the handler for a job type.
    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(h) = handlers.get(handler_type) {
            return Some(h.clone());
        }

        let category = handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = handler_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(h.clone());
        }

        handlers.get("*").cloned()
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        patterns.sort();
        patterns
    }
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}
