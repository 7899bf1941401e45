// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signal delivery.

use crate::error::{Result, WorkError};
use crate::model::{ProgressKey, WaitingEventKind};
use crate::work::{Outcome, Work, WorkContext};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

/// Delivers a signal to one waiting event.
#[derive(Debug, Clone)]
pub struct TriggerSignalWork {
    waiting_signal_id: i64,
    signal_name: String,
}

impl TriggerSignalWork {
    /// Work for the waiting signal.
    pub fn new(waiting_signal_id: i64, signal_name: impl Into<String>) -> Self {
        Self {
            waiting_signal_id,
            signal_name: signal_name.into(),
        }
    }
}

#[async_trait]
impl Work for TriggerSignalWork {
    #[instrument(skip(self, ctx), fields(waiting_signal_id = self.waiting_signal_id, signal = %self.signal_name))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();

        let Some(waiting) = services
            .events
            .get_waiting_event(tx, self.waiting_signal_id)
            .await?
        else {
            return Ok(Outcome::skipped(format!(
                "Waiting signal {} no longer exists",
                self.waiting_signal_id
            )));
        };
        if waiting.progress == ProgressKey::Handled {
            return Ok(Outcome::skipped(format!(
                "Waiting signal {} already received a signal",
                self.waiting_signal_id
            )));
        }

        match waiting.kind {
            WaitingEventKind::SignalStart => {
                let process_instance_id = services
                    .process_executor
                    .instantiate(tx, waiting.process_definition_id, Some(waiting.flow_node_name.as_str()), None)
                    .await?;
                info!(process_instance_id, "Process started by signal");
            }
            WaitingEventKind::SignalCatch => {
                services.events_handler.trigger_signal(tx, &waiting).await?;
                services
                    .events
                    .set_waiting_event_progress(tx, waiting.id, ProgressKey::Handled)
                    .await?;
            }
            WaitingEventKind::MessageStart | WaitingEventKind::MessageCatch => {
                return Err(WorkError::Other(format!(
                    "Waiting event {} listens for a message, not a signal",
                    waiting.id
                )));
            }
        }

        Ok(Outcome::Completed)
    }

    async fn handle_failure(&self, error: &WorkError, _ctx: &mut WorkContext) -> Result<()> {
        // Nothing was reserved; the rolled-back delivery leaves the event waiting.
        warn!(
            waiting_signal_id = self.waiting_signal_id,
            signal = %self.signal_name,
            error = %error,
            "Signal was not delivered"
        );
        Ok(())
    }

    fn description(&self) -> String {
        format!(
            "Deliver signal '{}' to waiting signal {}",
            self.signal_name, self.waiting_signal_id
        )
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Send signal '{}' again once the cause of the failure is fixed",
            self.signal_name
        )
    }
}
