//! Built-in interceptors.

use std::time::Instant;

use tracing::{debug, debug_span, warn};

use super::{CommandContext, CommandError, CommandInterceptor, Next};

/// Outermost interceptor: runs every command inside a `command` span and logs
/// its start, outcome and duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl CommandInterceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn invoke(&self, ctx: &mut CommandContext, next: Next<'_>) -> Result<(), CommandError> {
        let command = ctx.command_name();
        let span = debug_span!(
            "command",
            command,
            user_id = ?ctx.invocation().user_id,
            correlation_id = ?ctx.invocation().correlation_id,
        );
        span.in_scope(|| {
            let started = Instant::now();
            debug!("command started");

            let result = next(ctx);

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(()) => debug!(elapsed_ms, "command completed"),
                Err(e) => debug!(elapsed_ms, error = %e, "command failed"),
            }
            result
        })
    }
}

/// Innermost interceptor: wraps the command in a unit of work.
///
/// Commits when the command succeeds, rolls back when it fails. If a unit of
/// work is already open the command joins it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionInterceptor;

impl CommandInterceptor for TransactionInterceptor {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn invoke(&self, ctx: &mut CommandContext, next: Next<'_>) -> Result<(), CommandError> {
        if ctx.has_transaction() {
            return next(ctx);
        }

        let tx = ctx.store().begin()?;
        ctx.set_transaction(tx);

        let result = next(ctx);

        let Some(tx) = ctx.take_transaction() else {
            return result;
        };
        match result {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        command = ctx.command_name(),
                        error = %rollback_err,
                        "rollback failed"
                    );
                }
                Err(err)
            }
        }
    }
}
