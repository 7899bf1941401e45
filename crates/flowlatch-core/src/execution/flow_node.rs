// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow-node execution and child-completion notification.

use super::FailedStateSetter;
use crate::descriptor::FinishedChild;
use crate::error::{Result, WorkError};
use crate::fingerprint::{self, Precondition, StateFingerprint};
use crate::persistence::Transaction;
use crate::work::{Outcome, Work, WorkContext};
use async_trait::async_trait;
use tracing::{debug, info, instrument};

/// Advances one flow node by one step.
#[derive(Debug, Clone)]
pub struct ExecuteFlowNodeWork {
    process_definition_id: i64,
    process_instance_id: i64,
    flow_node_instance_id: i64,
    fingerprint: StateFingerprint,
}

impl ExecuteFlowNodeWork {
    /// Work for the flow node, expected in the fingerprinted state.
    pub fn new(
        process_definition_id: i64,
        process_instance_id: i64,
        flow_node_instance_id: i64,
        fingerprint: StateFingerprint,
    ) -> Self {
        Self {
            process_definition_id,
            process_instance_id,
            flow_node_instance_id,
            fingerprint,
        }
    }
}

#[async_trait]
impl Work for ExecuteFlowNodeWork {
    #[instrument(skip(self, ctx), fields(flow_node_instance_id = self.flow_node_instance_id, process_instance_id = self.process_instance_id))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();
        let flow_node = services.flow_nodes.get_flow_node(tx, self.flow_node_instance_id).await?;

        match fingerprint::check_execute(self.flow_node_instance_id, &self.fingerprint, flow_node)? {
            Precondition::NotMet(reason) => Ok(Outcome::Skipped { reason }),
            Precondition::Met(flow_node) => {
                debug!(state_id = flow_node.state_id, "Executing flow node");
                services.flow_node_executor.execute_flow_node(tx, &flow_node).await?;
                Ok(Outcome::Completed)
            }
        }
    }

    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let services = ctx.services_arc();
        let tx = Transaction::begin(services.transactions.as_ref(), "fail flow node").await?;
        let setter = FailedStateSetter::new(&services, tx.id());
        let failed = tx
            .run(setter.set_as_failed(self.flow_node_instance_id, Some(self.fingerprint.state_id)))
            .await?;
        info!(
            flow_node_instance_id = self.flow_node_instance_id,
            failed,
            error = %error,
            "Flow node execution failure handled"
        );
        Ok(())
    }

    fn description(&self) -> String {
        format!(
            "Execute flow node {} of process instance {} (definition {}) from state {}",
            self.flow_node_instance_id,
            self.process_instance_id,
            self.process_definition_id,
            self.fingerprint.state_id
        )
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Fix the cause of the failure, then replay flow node {} of process instance {}",
            self.flow_node_instance_id, self.process_instance_id
        )
    }
}

/// Tells a parent process that one of its children finished.
#[derive(Debug, Clone)]
pub struct NotifyChildFinishedWork {
    process_definition_id: i64,
    parent_process_instance_id: i64,
    child: FinishedChild,
}

impl NotifyChildFinishedWork {
    /// Work notifying `parent_process_instance_id` about `child`.
    pub fn new(process_definition_id: i64, parent_process_instance_id: i64, child: FinishedChild) -> Self {
        Self {
            process_definition_id,
            parent_process_instance_id,
            child,
        }
    }

    async fn notify_flow_node(
        &self,
        ctx: &WorkContext,
        flow_node_instance_id: i64,
        expected: &StateFingerprint,
    ) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();
        let child = services.flow_nodes.get_flow_node(tx, flow_node_instance_id).await?;

        match fingerprint::check_child_finished(flow_node_instance_id, expected, child) {
            Precondition::NotMet(reason) => Ok(Outcome::Skipped { reason }),
            Precondition::Met(child) => {
                services.flow_node_executor.child_finished(tx, &child).await?;
                Ok(Outcome::Completed)
            }
        }
    }

    async fn notify_caller(
        &self,
        ctx: &WorkContext,
        process_instance_id: i64,
        caller_id: i64,
        expected: crate::model::ProcessState,
    ) -> Result<Outcome> {
        let tx = ctx.transaction()?;
        let services = ctx.services();

        let Some(process) = services.processes.get_process(tx, process_instance_id).await? else {
            return Ok(Outcome::skipped(format!(
                "Process instance {} not found, its caller was probably already notified",
                process_instance_id
            )));
        };
        if process.state != expected {
            return Ok(Outcome::skipped(format!(
                "Process instance {} is in state {} instead of {}",
                process_instance_id, process.state, expected
            )));
        }

        // The caller must still be waiting for the called process.
        match services.flow_nodes.get_flow_node(tx, caller_id).await? {
            Some(caller) if !caller.terminal => {}
            _ => {
                return Ok(Outcome::skipped(format!(
                    "Caller {} of process instance {} is no longer waiting",
                    caller_id, process_instance_id
                )));
            }
        }

        services
            .flow_node_executor
            .child_process_finished(tx, &process, caller_id)
            .await?;
        Ok(Outcome::Completed)
    }
}

#[async_trait]
impl Work for NotifyChildFinishedWork {
    #[instrument(skip(self, ctx), fields(parent_process_instance_id = self.parent_process_instance_id))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        match &self.child {
            FinishedChild::FlowNode {
                flow_node_instance_id,
                fingerprint,
            } => {
                self.notify_flow_node(ctx, *flow_node_instance_id, fingerprint)
                    .await
            }
            FinishedChild::Process {
                process_instance_id,
                caller_id,
                state,
            } => {
                self.notify_caller(ctx, *process_instance_id, *caller_id, *state)
                    .await
            }
        }
    }

    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let services = ctx.services_arc();
        let (flow_node_instance_id, expected_state_id) = match &self.child {
            FinishedChild::FlowNode {
                flow_node_instance_id,
                fingerprint,
            } => (*flow_node_instance_id, Some(fingerprint.state_id)),
            FinishedChild::Process { caller_id, .. } => (*caller_id, None),
        };

        let tx = Transaction::begin(services.transactions.as_ref(), "fail notified flow node").await?;
        let setter = FailedStateSetter::new(&services, tx.id());
        let failed = tx
            .run(setter.set_as_failed(flow_node_instance_id, expected_state_id))
            .await?;
        info!(
            flow_node_instance_id,
            failed,
            error = %error,
            "Child notification failure handled"
        );
        Ok(())
    }

    fn description(&self) -> String {
        match &self.child {
            FinishedChild::FlowNode {
                flow_node_instance_id,
                ..
            } => format!(
                "Notify process instance {} (definition {}) that flow node {} finished",
                self.parent_process_instance_id, self.process_definition_id, flow_node_instance_id
            ),
            FinishedChild::Process {
                process_instance_id,
                caller_id,
                ..
            } => format!(
                "Notify caller {} in process instance {} that called process {} finished",
                caller_id, self.parent_process_instance_id, process_instance_id
            ),
        }
    }

    fn recovery_procedure(&self) -> String {
        match &self.child {
            FinishedChild::FlowNode {
                flow_node_instance_id,
                ..
            } => format!(
                "Replay the completion of flow node {} to continue process instance {}",
                flow_node_instance_id, self.parent_process_instance_id
            ),
            FinishedChild::Process { caller_id, .. } => format!(
                "Replay call activity {} of process instance {}",
                caller_id, self.parent_process_instance_id
            ),
        }
    }
}
