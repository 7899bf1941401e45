// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session binding decorator.

use super::{BoxedWork, Outcome, Work, WorkContext, panic_message};
use crate::error::{Result, WorkError};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of a bound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// A fresh session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binds a tenant session around work execution.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Open a session for the tenant.
    async fn bind(&self, tenant_id: Option<i64>) -> Result<SessionId>;

    /// Close a session.
    async fn unbind(&self, session: SessionId) -> Result<()>;
}

/// Binds a session before the inner work runs and unbinds it afterwards,
/// whatever the outcome, panics included.
///
/// An unbind failure is logged and never hides the inner result.
pub struct SessionWork {
    inner: BoxedWork,
}

impl SessionWork {
    /// Wrap `inner`.
    pub fn new(inner: BoxedWork) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Work for SessionWork {
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let services = ctx.services_arc();
        let session = services.sessions.bind(ctx.tenant_id()).await?;
        debug!(%session, tenant_id = ?ctx.tenant_id(), "Session bound");
        ctx.set_session(Some(session));

        let result = AssertUnwindSafe(self.inner.execute(ctx)).catch_unwind().await;

        ctx.set_session(None);
        if let Err(e) = services.sessions.unbind(session).await {
            warn!(%session, error = %e, "Failed to unbind session");
        }

        match result {
            Ok(result) => result,
            Err(panic) => {
                debug!(%session, panic = %panic_message(panic.as_ref()), "Session released after panic");
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let services = ctx.services_arc();
        let session = services.sessions.bind(ctx.tenant_id()).await?;
        ctx.set_session(Some(session));

        let result = AssertUnwindSafe(self.inner.handle_failure(error, ctx))
            .catch_unwind()
            .await;

        ctx.set_session(None);
        if let Err(e) = services.sessions.unbind(session).await {
            warn!(%session, error = %e, "Failed to unbind session after failure handling");
        }

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn recovery_procedure(&self) -> String {
        self.inner.recovery_procedure()
    }
}
