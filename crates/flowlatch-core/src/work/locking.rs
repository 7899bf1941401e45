// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-instance lock decorators.

use super::{BoxedWork, Outcome, Work, WorkContext};
use crate::descriptor::WorkDescriptor;
use crate::error::{Result, WorkError};
use crate::lock::{LockGuard, LockKey};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Holds the process-instance lock around the inner work, waiting at most a
/// bounded time for it. An expired wait is a retryable
/// [`WorkError::LockTimeout`].
pub struct LockProcessInstanceWork {
    inner: BoxedWork,
    key: LockKey,
    timeout: Duration,
}

impl LockProcessInstanceWork {
    /// Wrap `inner`.
    pub fn new(inner: BoxedWork, key: LockKey, timeout: Duration) -> Self {
        Self {
            inner,
            key,
            timeout,
        }
    }
}

#[async_trait]
impl Work for LockProcessInstanceWork {
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let services = ctx.services_arc();
        let Some(lock) = services.locks.try_lock(&self.key, self.timeout).await? else {
            warn!(lock = %self.key, timeout_ms = self.timeout.as_millis() as u64, "Process instance busy");
            return Err(WorkError::LockTimeout {
                resource: self.key.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        };
        debug!(lock = %self.key, "Lock acquired");

        // The guard releases on unwind too.
        let guard = LockGuard::new(services.locks.as_ref(), lock);
        let result = self.inner.execute(ctx).await;
        if let Err(e) = guard.release() {
            warn!(lock = %self.key, error = %e, "Failed to release lock");
        }
        result
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

/// Holds the process-instance lock around the inner work without waiting.
///
/// When the lock is busy the work's descriptor is handed to the lock service,
/// which resubmits it once the holder releases, and the work ends as
/// [`Outcome::Deferred`].
pub struct RequeueOnLockedWork {
    inner: BoxedWork,
    key: LockKey,
    descriptor: WorkDescriptor,
}

impl RequeueOnLockedWork {
    /// Wrap `inner`; `descriptor` is what gets resubmitted.
    pub fn new(inner: BoxedWork, key: LockKey, descriptor: WorkDescriptor) -> Self {
        Self {
            inner,
            key,
            descriptor,
        }
    }
}

#[async_trait]
impl Work for RequeueOnLockedWork {
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let services = ctx.services_arc();
        let Some(lock) = services
            .locks
            .try_lock_or_requeue(&self.key, &self.descriptor)
            .await?
        else {
            debug!(lock = %self.key, work = self.descriptor.type_tag(), "Process instance busy, work deferred");
            return Ok(Outcome::Deferred {
                resource: self.key.clone(),
            });
        };

        let guard = LockGuard::new(services.locks.as_ref(), lock);
        let result = self.inner.execute(ctx).await;
        if let Err(e) = guard.release() {
            warn!(lock = %self.key, error = %e, "Failed to release lock");
        }
        result
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
