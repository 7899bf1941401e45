// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The unit-of-work abstraction and its decorators.
//!
//! A concrete work only knows how to do its job. Cross-cutting concerns are
//! layered around it as decorators, each wrapping the next:
//!
//! ```text
//! FailureHandlingWork           catch errors and panics, compensate, raise incidents
//!   └─ SessionWork              bind a session for the tenant, always unbind
//!        └─ LockProcessInstanceWork / RequeueOnLockedWork
//!             └─ TransactionWork    commit on success, roll back on error or panic
//!                  └─ ContextWork   attach identifiers for diagnostics
//!                       └─ concrete work
//! ```
//!
//! [`WorkChain`] composes the stack; [`crate::factory::WorkFactory`] picks the
//! stack for each descriptor kind.

mod context;
mod failure;
mod locking;
mod session;
mod transaction;

pub use context::{ContextWork, keys};
pub use failure::FailureHandlingWork;
pub use locking::{LockProcessInstanceWork, RequeueOnLockedWork};
pub use session::{SessionId, SessionManager, SessionWork};
pub use transaction::TransactionWork;

use crate::descriptor::WorkDescriptor;
use crate::error::{Result, WorkError};
use crate::lock::LockKey;
use crate::persistence::TransactionId;
use crate::services::Services;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// How a work ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The work did its job.
    Completed,
    /// A precondition was not met; nothing was changed.
    Skipped {
        /// Why the work was skipped.
        reason: String,
    },
    /// The process instance was locked; the work will be resubmitted when the
    /// lock is released.
    Deferred {
        /// The busy lock.
        resource: LockKey,
    },
    /// A transient failure; deliver the work again later.
    Retry {
        /// The failure.
        cause: WorkError,
    },
    /// The work failed and its failure handler compensated.
    Handled {
        /// The failure.
        cause: WorkError,
    },
    /// The work failed and so did its failure handler; an incident was raised.
    IncidentReported {
        /// The original failure.
        cause: WorkError,
    },
}

impl Outcome {
    /// A skipped outcome.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    /// Short name for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Deferred { .. } => "deferred",
            Outcome::Retry { .. } => "retry",
            Outcome::Handled { .. } => "handled",
            Outcome::IncidentReported { .. } => "incident",
        }
    }

    /// Whether the queue entry can be acknowledged.
    pub fn is_final(&self) -> bool {
        !matches!(self, Outcome::Retry { .. })
    }
}

/// Per-execution context handed down the decorator chain.
pub struct WorkContext {
    services: Arc<Services>,
    tenant_id: Option<i64>,
    session: Option<SessionId>,
    transaction: Option<TransactionId>,
    annotations: BTreeMap<&'static str, String>,
}

impl WorkContext {
    /// New context for a work running for `tenant_id`.
    pub fn new(services: Arc<Services>, tenant_id: Option<i64>) -> Self {
        Self {
            services,
            tenant_id,
            session: None,
            transaction: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Shared collaborators.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Owned handle on the collaborators, for holding across `&mut self` calls.
    pub fn services_arc(&self) -> Arc<Services> {
        self.services.clone()
    }

    /// Tenant the work runs for.
    pub fn tenant_id(&self) -> Option<i64> {
        self.tenant_id
    }

    /// Session bound by [`SessionWork`], if any.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub(crate) fn set_session(&mut self, session: Option<SessionId>) {
        self.session = session;
    }

    /// Transaction opened by [`TransactionWork`]. Store calls of a concrete
    /// work run under it.
    pub fn transaction(&self) -> Result<TransactionId> {
        self.transaction
            .ok_or_else(|| WorkError::transaction("store access", "no transaction is open"))
    }

    pub(crate) fn set_transaction(&mut self, transaction: Option<TransactionId>) {
        self.transaction = transaction;
    }

    /// Attach a diagnostic annotation.
    pub fn annotate(&mut self, key: &'static str, value: impl ToString) {
        self.annotations.insert(key, value.to_string());
    }

    /// Annotations collected so far.
    pub fn annotations(&self) -> &BTreeMap<&'static str, String> {
        &self.annotations
    }
}

/// A unit of work.
#[async_trait]
pub trait Work: Send + Sync {
    /// Do the work.
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome>;

    /// Compensate after `execute` failed with `error`.
    ///
    /// Called outside the transaction the failed execution ran in.
    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()>;

    /// What the work does, for logs and incidents.
    fn description(&self) -> String;

    /// How an operator recovers when both execution and compensation failed.
    fn recovery_procedure(&self) -> String;
}

/// A boxed work, as decorators hold them.
pub type BoxedWork = Box<dyn Work>;

/// Composes a decorator stack, innermost first.
///
/// ```ignore
/// let work = WorkChain::new(ExecuteFlowNodeWork::new(7, 10, 42, fingerprint))
///     .annotated(vec![(keys::FLOW_NODE_INSTANCE_ID, "42".to_string())])
///     .in_transaction()
///     .locked(LockKey::process_instance(10, None), Duration::from_millis(20))
///     .with_session()
///     .with_failure_handling()
///     .build();
/// ```
pub struct WorkChain {
    work: BoxedWork,
}

impl WorkChain {
    /// Start from a concrete work.
    pub fn new(work: impl Work + 'static) -> Self {
        Self {
            work: Box::new(work),
        }
    }

    /// Wrap with an arbitrary decorator.
    pub fn layer<F>(self, decorate: F) -> Self
    where
        F: FnOnce(BoxedWork) -> BoxedWork,
    {
        Self {
            work: decorate(self.work),
        }
    }

    /// Attach diagnostic annotations.
    pub fn annotated(self, entries: Vec<(&'static str, String)>) -> Self {
        self.layer(|inner| Box::new(ContextWork::new(inner, entries)))
    }

    /// Run inside one transaction.
    pub fn in_transaction(self) -> Self {
        self.layer(|inner| Box::new(TransactionWork::new(inner)))
    }

    /// Hold the process-instance lock, waiting at most `timeout`.
    pub fn locked(self, key: LockKey, timeout: Duration) -> Self {
        self.layer(|inner| Box::new(LockProcessInstanceWork::new(inner, key, timeout)))
    }

    /// Hold the process-instance lock, or park `descriptor` until it is free.
    pub fn locked_or_requeued(self, key: LockKey, descriptor: WorkDescriptor) -> Self {
        self.layer(|inner| Box::new(RequeueOnLockedWork::new(inner, key, descriptor)))
    }

    /// Bind a session for the duration of the work.
    pub fn with_session(self) -> Self {
        self.layer(|inner| Box::new(SessionWork::new(inner)))
    }

    /// Catch failures and run compensation.
    pub fn with_failure_handling(self) -> Self {
        self.layer(|inner| Box::new(FailureHandlingWork::new(inner)))
    }

    /// The composed work.
    pub fn build(self) -> BoxedWork {
        self.work
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
