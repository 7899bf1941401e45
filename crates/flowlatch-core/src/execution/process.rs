// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-level works: instantiation and resumption after connectors.

use super::message::release_couple;
use crate::descriptor::MessageCouple;
use crate::error::{Result, WorkError};
use crate::model::{ConnectorEvent, ProcessState, ProgressKey};
use crate::persistence::Transaction;
use crate::work::{Outcome, Work, WorkContext};
use async_trait::async_trait;
use tracing::{info, instrument};
use uuid::Uuid;

/// Starts a new process instance.
///
/// The instantiation token is recorded with the new instance in the same
/// transaction. A redelivered work finds its token and is skipped.
#[derive(Debug, Clone)]
pub struct InstantiateProcessWork {
    process_definition_id: i64,
    start_flow_node: Option<String>,
    message: Option<MessageCouple>,
    instantiation_token: Uuid,
}

impl InstantiateProcessWork {
    /// Work starting `process_definition_id`, optionally at a given element
    /// and with the message that triggered it.
    pub fn new(
        process_definition_id: i64,
        start_flow_node: Option<String>,
        message: Option<MessageCouple>,
        instantiation_token: Uuid,
    ) -> Self {
        Self {
            process_definition_id,
            start_flow_node,
            message,
            instantiation_token,
        }
    }
}

#[async_trait]
impl Work for InstantiateProcessWork {
    #[instrument(skip(self, ctx), fields(process_definition_id = self.process_definition_id, token = %self.instantiation_token))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();

        if let Some(existing) = services
            .processes
            .find_instantiation(tx, self.instantiation_token)
            .await?
        {
            return Ok(Outcome::skipped(format!(
                "Instantiation {} already started process instance {}",
                self.instantiation_token, existing
            )));
        }

        let message = match &self.message {
            Some(couple) => match services.events.get_message(tx, couple.message_instance_id).await? {
                Some(message) => Some(message),
                None => {
                    return Ok(Outcome::skipped(format!(
                        "Message {} that triggers the start was already consumed",
                        couple.message_instance_id
                    )));
                }
            },
            None => None,
        };

        let process_instance_id = services
            .process_executor
            .instantiate(
                tx,
                self.process_definition_id,
                self.start_flow_node.as_deref(),
                message.as_ref(),
            )
            .await?;
        services
            .processes
            .record_instantiation(tx, self.instantiation_token, process_instance_id)
            .await?;

        if let Some(couple) = &self.message {
            services.events.delete_message(tx, couple.message_instance_id).await?;
            if services
                .events
                .get_waiting_event(tx, couple.waiting_message_id)
                .await?
                .is_some()
            {
                services
                    .events
                    .set_waiting_event_progress(tx, couple.waiting_message_id, ProgressKey::Free)
                    .await?;
            }
        }

        info!(process_instance_id, "Process instantiated");
        Ok(Outcome::Completed)
    }

    async fn handle_failure(&self, _error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let Some(couple) = self.message else {
            return Ok(());
        };
        let services = ctx.services_arc();
        let tx = Transaction::begin(services.transactions.as_ref(), "release start message").await?;
        let id = tx.id();
        tx.run(release_couple(
            &services,
            id,
            couple.message_instance_id,
            couple.waiting_message_id,
        ))
        .await
    }

    fn description(&self) -> String {
        match &self.start_flow_node {
            Some(start) => format!(
                "Instantiate process definition {} at '{}'",
                self.process_definition_id, start
            ),
            None => format!("Instantiate process definition {}", self.process_definition_id),
        }
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Start process definition {} again once the cause of the failure is fixed",
            self.process_definition_id
        )
    }
}

/// Continues a process whose connectors for one phase have all finished.
///
/// Only acts while the process is still in the phase's state: INITIALIZING
/// for on-enter connectors, COMPLETING for on-finish connectors.
#[derive(Debug, Clone)]
pub struct ResumeProcessWork {
    process_definition_id: i64,
    process_instance_id: i64,
    activation_event: ConnectorEvent,
}

impl ResumeProcessWork {
    /// Work resuming the process after its `activation_event` connectors.
    pub fn new(process_definition_id: i64, process_instance_id: i64, activation_event: ConnectorEvent) -> Self {
        Self {
            process_definition_id,
            process_instance_id,
            activation_event,
        }
    }

    fn expected_state(&self) -> ProcessState {
        match self.activation_event {
            ConnectorEvent::OnEnter => ProcessState::Initializing,
            ConnectorEvent::OnFinish => ProcessState::Completing,
        }
    }
}

#[async_trait]
impl Work for ResumeProcessWork {
    #[instrument(skip(self, ctx), fields(process_instance_id = self.process_instance_id))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();

        let Some(process) = services.processes.get_process(tx, self.process_instance_id).await? else {
            return Ok(Outcome::skipped(format!(
                "Process instance {} not found",
                self.process_instance_id
            )));
        };
        let expected = self.expected_state();
        if process.state != expected {
            return Ok(Outcome::skipped(format!(
                "Process instance {} is in state {} instead of {}",
                self.process_instance_id, process.state, expected
            )));
        }

        services
            .process_executor
            .continue_after_connectors(tx, &process, self.activation_event)
            .await?;
        Ok(Outcome::Completed)
    }

    async fn handle_failure(&self, _error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let services = ctx.services_arc();
        let tx = Transaction::begin(services.transactions.as_ref(), "fail process").await?;
        let id = tx.id();
        tx.run(async {
            match services.processes.get_process(id, self.process_instance_id).await? {
                Some(process) if !process.state.is_terminal() => {
                    services
                        .processes
                        .set_process_state(id, self.process_instance_id, ProcessState::Error)
                        .await
                }
                _ => Ok(()),
            }
        })
        .await
    }

    fn description(&self) -> String {
        format!(
            "Resume process instance {} (definition {}) after its {} connectors",
            self.process_instance_id, self.process_definition_id, self.activation_event
        )
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Fix the cause of the failure, then replay the {} phase of process instance {}",
            self.activation_event, self.process_instance_id
        )
    }
}
