//! Per-invocation state threaded through the interceptor chain.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use jobflow_core::Clock;

use super::CommandError;
use crate::jobs::{JobStore, Transaction};

/// Who is invoking a command, passed explicitly instead of living in
/// thread-local state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    /// `None` for engine-internal invocations (acquired job execution).
    pub user_id: Option<String>,
    pub tenant_ids: Vec<String>,
    pub correlation_id: Option<String>,
}

impl InvocationContext {
    /// The engine acting on its own behalf.
    pub fn system() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_ids.push(tenant_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_system(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Mutable state of one command invocation.
///
/// Interceptors see the same context the command eventually runs with; the
/// transaction interceptor opens the unit of work here and the command uses
/// it through [`CommandContext::transaction`].
pub struct CommandContext {
    command_name: &'static str,
    invocation: InvocationContext,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    transaction: Option<Box<dyn Transaction>>,
}

impl CommandContext {
    pub(crate) fn new(
        command_name: &'static str,
        invocation: InvocationContext,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            command_name,
            invocation,
            store,
            clock,
            transaction: None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        self.command_name
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Read-side access to the store, outside the unit of work.
    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// The open unit of work.
    pub fn transaction(&mut self) -> Result<&mut dyn Transaction, CommandError> {
        match self.transaction.as_mut() {
            Some(tx) => Ok(tx.as_mut()),
            None => Err(CommandError::NoTransaction(self.command_name)),
        }
    }

    pub fn set_transaction(&mut self, transaction: Box<dyn Transaction>) {
        self.transaction = Some(transaction);
    }

    pub fn take_transaction(&mut self) -> Option<Box<dyn Transaction>> {
        self.transaction.take()
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("command_name", &self.command_name)
            .field("invocation", &self.invocation)
            .field("has_transaction", &self.transaction.is_some())
            .finish()
    }
}
