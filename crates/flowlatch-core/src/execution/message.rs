// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery of matched message couples.

use crate::error::{Result, WorkError};
use crate::model::{ProgressKey, WaitingEventKind};
use crate::persistence::{Transaction, TransactionId};
use crate::services::Services;
use crate::work::{Outcome, Work, WorkContext};
use async_trait::async_trait;
use tracing::{debug, info, instrument};

/// Delivers a message to the waiting event it was matched with.
///
/// Matching reserves both sides as `IN_PROGRESS`. A couple whose sides are no
/// longer reserved was released (by a restart or a failed attempt) and will
/// be matched again, so the work is skipped.
#[derive(Debug, Clone)]
pub struct ExecuteMessageCoupleWork {
    message_instance_id: i64,
    waiting_message_id: i64,
}

impl ExecuteMessageCoupleWork {
    /// Work for the couple.
    pub fn new(message_instance_id: i64, waiting_message_id: i64) -> Self {
        Self {
            message_instance_id,
            waiting_message_id,
        }
    }
}

/// Puts both sides of a couple back to `FREE` so they can be matched again.
pub(crate) async fn release_couple(
    services: &Services,
    tx: TransactionId,
    message_instance_id: i64,
    waiting_message_id: i64,
) -> Result<()> {
    if services.events.get_message(tx, message_instance_id).await?.is_some() {
        services
            .events
            .set_message_progress(tx, message_instance_id, ProgressKey::Free)
            .await?;
    }
    if services
        .events
        .get_waiting_event(tx, waiting_message_id)
        .await?
        .is_some()
    {
        services
            .events
            .set_waiting_event_progress(tx, waiting_message_id, ProgressKey::Free)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl Work for ExecuteMessageCoupleWork {
    #[instrument(skip(self, ctx), fields(message_instance_id = self.message_instance_id, waiting_message_id = self.waiting_message_id))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();

        let message = services.events.get_message(tx, self.message_instance_id).await?;
        let waiting = services
            .events
            .get_waiting_event(tx, self.waiting_message_id)
            .await?;
        let (Some(message), Some(waiting)) = (message, waiting) else {
            return Ok(Outcome::skipped(format!(
                "Message {} or waiting message {} no longer exists",
                self.message_instance_id, self.waiting_message_id
            )));
        };

        if message.progress != ProgressKey::InProgress || waiting.progress != ProgressKey::InProgress {
            return Ok(Outcome::skipped(format!(
                "Message {} and waiting message {} are no longer reserved for each other",
                self.message_instance_id, self.waiting_message_id
            )));
        }

        match waiting.kind {
            WaitingEventKind::MessageStart => {
                let process_instance_id = services
                    .process_executor
                    .instantiate(
                        tx,
                        waiting.process_definition_id,
                        Some(waiting.flow_node_name.as_str()),
                        Some(&message),
                    )
                    .await?;
                // Start events stay subscribed.
                services
                    .events
                    .set_waiting_event_progress(tx, waiting.id, ProgressKey::Free)
                    .await?;
                info!(process_instance_id, "Process started by message");
            }
            WaitingEventKind::MessageCatch => {
                services
                    .events_handler
                    .trigger_catch_message(tx, &waiting, &message)
                    .await?;
                services
                    .events
                    .set_waiting_event_progress(tx, waiting.id, ProgressKey::Handled)
                    .await?;
                debug!(flow_node_instance_id = ?waiting.flow_node_instance_id, "Message delivered");
            }
            WaitingEventKind::SignalStart | WaitingEventKind::SignalCatch => {
                return Err(WorkError::Other(format!(
                    "Waiting event {} listens for a signal, not a message",
                    waiting.id
                )));
            }
        }

        services.events.delete_message(tx, message.id).await?;
        Ok(Outcome::Completed)
    }

    async fn handle_failure(&self, _error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let services = ctx.services_arc();
        let tx = Transaction::begin(services.transactions.as_ref(), "release message couple").await?;
        let id = tx.id();
        tx.run(release_couple(&services, id, self.message_instance_id, self.waiting_message_id))
            .await
    }

    fn description(&self) -> String {
        format!(
            "Deliver message {} to waiting message {}",
            self.message_instance_id, self.waiting_message_id
        )
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Set message {} and waiting message {} back to FREE so they are matched again",
            self.message_instance_id, self.waiting_message_id
        )
    }
}
