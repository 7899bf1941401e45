// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Releases message and waiting-event reservations.

use super::{RestartHandler, RestartReport};
use crate::error::Result;
use crate::model::ProgressKey;
use crate::persistence::{Transaction, TransactionId};
use crate::services::Services;
use async_trait::async_trait;
use tracing::debug;

/// Puts every `IN_PROGRESS` message and waiting event back to `FREE`.
///
/// The couple works that reserved them were lost with the crash.
pub struct MessageResetHandler {
    batch_size: usize,
}

impl MessageResetHandler {
    /// Handler resetting `batch_size` entities per transaction.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    async fn reset_messages_batch(&self, services: &Services, tx: TransactionId) -> Result<usize> {
        let ids = services.events.list_messages_in_progress(tx, self.batch_size).await?;
        for id in &ids {
            services.events.set_message_progress(tx, *id, ProgressKey::Free).await?;
        }
        Ok(ids.len())
    }

    async fn reset_waiting_events_batch(
        &self,
        services: &Services,
        tx: TransactionId,
    ) -> Result<usize> {
        let ids = services
            .events
            .list_waiting_events_in_progress(tx, self.batch_size)
            .await?;
        for id in &ids {
            services
                .events
                .set_waiting_event_progress(tx, *id, ProgressKey::Free)
                .await?;
        }
        Ok(ids.len())
    }
}

#[async_trait]
impl RestartHandler for MessageResetHandler {
    fn name(&self) -> &'static str {
        "message-reset"
    }

    async fn handle_restart(&self, services: &Services, report: &mut RestartReport) -> Result<()> {
        loop {
            let tx = Transaction::begin(services.transactions.as_ref(), "reset messages").await?;
            let id = tx.id();
            let reset = tx.run(self.reset_messages_batch(services, id)).await?;
            report.reset_messages += reset;
            if reset < self.batch_size {
                break;
            }
        }

        loop {
            let tx = Transaction::begin(services.transactions.as_ref(), "reset waiting events").await?;
            let id = tx.id();
            let reset = tx.run(self.reset_waiting_events_batch(services, id)).await?;
            report.reset_waiting_events += reset;
            if reset < self.batch_size {
                break;
            }
        }

        debug!(
            messages = report.reset_messages,
            waiting_events = report.reset_waiting_events,
            "Reservations released"
        );
        Ok(())
    }
}
