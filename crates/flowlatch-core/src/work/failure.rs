// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure-handling decorator.

use super::{BoxedWork, Outcome, Work, WorkContext, panic_message};
use crate::error::{Result, WorkError};
use crate::incident::Incident;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

/// Outermost decorator: turns every failure of the chain into an [`Outcome`].
///
/// 1. Retryable errors become [`Outcome::Retry`] without compensation.
/// 2. Other errors and panics run [`Work::handle_failure`]; success gives
///    [`Outcome::Handled`].
/// 3. If compensation fails transiently (a busy process lock), the work is
///    retried as a whole: [`Outcome::Retry`] carrying the compensation error.
/// 4. If compensation fails otherwise, an [`Incident`] is reported and the
///    outcome is [`Outcome::IncidentReported`].
pub struct FailureHandlingWork {
    inner: BoxedWork,
}

impl FailureHandlingWork {
    /// Wrap `inner`.
    pub fn new(inner: BoxedWork) -> Self {
        Self { inner }
    }

    async fn report_incident(&self, cause: &WorkError, handling_error: &WorkError, ctx: &WorkContext) {
        let incident = Incident::new(self.inner.description(), self.inner.recovery_procedure(), cause)
            .with_handling_error(handling_error)
            .with_tenant(ctx.tenant_id())
            .with_context(ctx.annotations());
        error!(
            work = %incident.description,
            cause = %cause,
            handling_error = %handling_error,
            "Failure handling failed, reporting incident"
        );
        ctx.services().incidents.report(&incident).await;
    }
}

#[async_trait]
impl Work for FailureHandlingWork {
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let attempt = AssertUnwindSafe(self.inner.execute(ctx)).catch_unwind().await;

        let cause = match attempt {
            Ok(Ok(outcome)) => {
                match &outcome {
                    Outcome::Skipped { reason } => {
                        info!(work = %self.inner.description(), %reason, "Work skipped")
                    }
                    Outcome::Deferred { resource } => {
                        debug!(work = %self.inner.description(), lock = %resource, "Work deferred")
                    }
                    _ => debug!(work = %self.inner.description(), outcome = outcome.as_str(), "Work finished"),
                }
                return Ok(outcome);
            }
            Ok(Err(e)) => e,
            Err(panic) => WorkError::Panicked(panic_message(panic.as_ref())),
        };

        if cause.is_retryable() {
            debug!(work = %self.inner.description(), error = %cause, "Work failed transiently, will retry");
            return Ok(Outcome::Retry { cause });
        }

        warn!(
            work = %self.inner.description(),
            error_code = cause.error_code(),
            error = %cause,
            "Work failed, handling failure"
        );

        let handled = AssertUnwindSafe(self.inner.handle_failure(&cause, ctx))
            .catch_unwind()
            .await;

        let handling_error = match handled {
            Ok(Ok(())) => {
                info!(work = %self.inner.description(), "Failure handled");
                return Ok(Outcome::Handled { cause });
            }
            Ok(Err(e)) => e,
            Err(panic) => WorkError::Panicked(panic_message(panic.as_ref())),
        };

        if handling_error.is_retryable() {
            warn!(
                work = %self.inner.description(),
                cause = %cause,
                error = %handling_error,
                "Failure handling failed transiently, will retry"
            );
            return Ok(Outcome::Retry {
                cause: handling_error,
            });
        }

        self.report_incident(&cause, &handling_error, ctx).await;
        Ok(Outcome::IncidentReported { cause })
    }

    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        self.inner.handle_failure(error, ctx).await
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn recovery_procedure(&self) -> String {
        self.inner.recovery_procedure()
    }
}
