//! Command execution pipeline.
//!
//! Every state-changing operation is a [`Command`] run through an ordered
//! chain of [`CommandInterceptor`]s:
//!
//! ```text
//! execute(command)
//!   ↓
//! LoggingInterceptor        (always first)
//!   ↓
//! user interceptors         (registration order in, reverse order out)
//!   ↓
//! TransactionInterceptor    (always last: begin / commit / rollback)
//!   ↓
//! command.execute(ctx)
//! ```
//!
//! An interceptor may act before and after calling `next`, or short-circuit by
//! not calling it at all; the pipeline then reports [`CommandError::Vetoed`].

mod context;
pub mod interceptors;

use std::sync::Arc;

use jobflow_core::{Clock, JobId};

use crate::jobs::{FailureDetail, JobStore, JobStoreError};

pub use context::{CommandContext, InvocationContext};
pub use interceptors::{LoggingInterceptor, TransactionInterceptor};

/// Pipeline/command error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("no job handler registered for type '{0}'")]
    UnknownHandlerType(String),
    #[error("job handler failed: {}", .0.message)]
    HandlerFailed(FailureDetail),
    #[error("job {0} is locked by another owner")]
    JobLocked(JobId),
    #[error("command '{0}' was vetoed by an interceptor")]
    Vetoed(&'static str),
    #[error("command '{0}' needs an open transaction")]
    NoTransaction(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for CommandError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::NotFound(id) => CommandError::JobNotFound(id),
            other => CommandError::Store(other),
        }
    }
}

impl CommandError {
    /// Lost a race with another node or a management action: the job is gone
    /// or was changed underneath. Nothing to record.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            CommandError::JobNotFound(_) | CommandError::Store(JobStoreError::Conflict { .. })
        )
    }

    /// Failure description to persist on the job.
    pub fn failure_detail(&self) -> FailureDetail {
        match self {
            CommandError::HandlerFailed(detail) => detail.clone(),
            other => FailureDetail::new(other.to_string(), format!("{other:?}")),
        }
    }
}

/// A unit of engine behavior executed inside the pipeline.
pub trait Command {
    type Output;

    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output, CommandError>;
}

/// Continuation handed to an interceptor.
pub type Next<'a> = &'a mut dyn FnMut(&mut CommandContext) -> Result<(), CommandError>;

/// Cross-cutting behavior around every command.
pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke(&self, ctx: &mut CommandContext, next: Next<'_>) -> Result<(), CommandError>;
}

/// Interceptor backed by a closure.
pub struct FnInterceptor<F> {
    name: &'static str,
    f: F,
}

/// Wrap a closure as an interceptor.
pub fn interceptor_fn<F>(name: &'static str, f: F) -> FnInterceptor<F>
where
    F: Fn(&mut CommandContext, Next<'_>) -> Result<(), CommandError> + Send + Sync,
{
    FnInterceptor { name, f }
}

impl<F> CommandInterceptor for FnInterceptor<F>
where
    F: Fn(&mut CommandContext, Next<'_>) -> Result<(), CommandError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn invoke(&self, ctx: &mut CommandContext, next: Next<'_>) -> Result<(), CommandError> {
        (self.f)(ctx, next)
    }
}

/// Reusable command execution engine.
#[derive(Clone)]
pub struct CommandPipeline {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    interceptors: Arc<[Arc<dyn CommandInterceptor>]>,
}

impl CommandPipeline {
    pub fn builder(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> CommandPipelineBuilder {
        CommandPipelineBuilder {
            store,
            clock,
            custom: Vec::new(),
        }
    }

    /// Run `command` through the interceptor chain.
    pub fn execute<C: Command>(
        &self,
        command: &C,
        invocation: InvocationContext,
    ) -> Result<C::Output, CommandError> {
        let mut ctx = CommandContext::new(
            command.name(),
            invocation,
            self.store.clone(),
            self.clock.clone(),
        );

        let mut output = None;
        proceed(&self.interceptors, &mut ctx, &mut |ctx: &mut CommandContext| {
            output = Some(command.execute(ctx)?);
            Ok(())
        })?;

        output.ok_or(CommandError::Vetoed(command.name()))
    }

    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for CommandPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("interceptors", &self.interceptor_names())
            .finish()
    }
}

fn proceed(
    chain: &[Arc<dyn CommandInterceptor>],
    ctx: &mut CommandContext,
    terminal: &mut dyn FnMut(&mut CommandContext) -> Result<(), CommandError>,
) -> Result<(), CommandError> {
    match chain.split_first() {
        Some((head, rest)) => head.invoke(ctx, &mut |ctx: &mut CommandContext| {
            proceed(rest, ctx, &mut *terminal)
        }),
        None => terminal(ctx),
    }
}

pub struct CommandPipelineBuilder {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    custom: Vec<Arc<dyn CommandInterceptor>>,
}

impl CommandPipelineBuilder {
    /// Add an interceptor between the built-in logging and transaction ones.
    pub fn interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.custom.push(interceptor);
        self
    }

    pub fn interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn CommandInterceptor>>,
    ) -> Self {
        self.custom.extend(interceptors);
        self
    }

    pub fn build(self) -> CommandPipeline {
        let mut chain: Vec<Arc<dyn CommandInterceptor>> = Vec::with_capacity(self.custom.len() + 2);
        chain.push(Arc::new(LoggingInterceptor));
        chain.extend(self.custom);
        chain.push(Arc::new(TransactionInterceptor));
        CommandPipeline {
            store: self.store,
            clock: self.clock,
            interceptors: chain.into(),
        }
    }
}
