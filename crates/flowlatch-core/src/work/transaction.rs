// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction decorator.

use super::{BoxedWork, Outcome, Work, WorkContext};
use crate::error::{Result, WorkError};
use crate::persistence::Transaction;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

/// Runs the inner work in one transaction: commit on success, roll back on an
/// error or a panic. A panic is re-raised after the rollback.
///
/// The transaction is exposed to the inner work through
/// [`WorkContext::transaction`] while it executes.
///
/// [`Work::handle_failure`] passes straight through; compensation opens its
/// own transaction.
pub struct TransactionWork {
    inner: BoxedWork,
}

impl TransactionWork {
    /// Wrap `inner`.
    pub fn new(inner: BoxedWork) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Work for TransactionWork {
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let services = ctx.services_arc();
        let tx = Transaction::begin(services.transactions.as_ref(), "execute work").await?;

        ctx.set_transaction(Some(tx.id()));
        let result = AssertUnwindSafe(self.inner.execute(ctx)).catch_unwind().await;
        ctx.set_transaction(None);
        match result {
            Ok(result) => tx.finish(result).await,
            Err(panic) => {
                tx.rollback().await;
                std::panic::resume_unwind(panic)
            }
        }
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
