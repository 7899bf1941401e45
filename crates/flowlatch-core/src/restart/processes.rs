// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Re-registration of process-level works.

use super::{RestartHandler, RestartReport};
use crate::descriptor::{FinishedChild, WorkDescriptor, WorkKind};
use crate::error::Result;
use crate::model::{ContainerRef, ProcessInstance, ProcessState};
use crate::persistence::{Transaction, TransactionId};
use crate::services::Services;
use async_trait::async_trait;
use tracing::{debug, info};

const STATES_TO_RESTART: &[ProcessState] = &[
    ProcessState::Initializing,
    ProcessState::Completing,
    ProcessState::Completed,
    ProcessState::Aborted,
    ProcessState::Cancelled,
];

/// Re-drives processes that were between phases when the engine stopped.
///
/// A process in `INITIALIZING` or `COMPLETING` gets a work for its next
/// pending connector, or a `RESUME_PROCESS` when all connectors of the phase
/// are done. A finished called process whose caller still waits gets a
/// `NOTIFY_CHILD_FINISHED` for that caller.
pub struct ProcessRestartHandler {
    batch_size: usize,
}

impl ProcessRestartHandler {
    /// Handler working in batches of `batch_size`.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    async fn discover(&self, services: &Services) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        let mut after_id = 0;
        loop {
            let tx = Transaction::begin(services.transactions.as_ref(), "list processes to restart")
                .await?;
            let id = tx.id();
            let page = tx
                .run(services.processes.list_processes_in_states(
                    id,
                    STATES_TO_RESTART,
                    after_id,
                    self.batch_size,
                ))
                .await?;

            let Some(last) = page.last().copied() else {
                break;
            };
            let full = page.len() >= self.batch_size;
            ids.extend(page);
            if !full {
                break;
            }
            after_id = last;
        }
        Ok(ids)
    }

    async fn redrive(
        &self,
        services: &Services,
        tx: TransactionId,
        process: &ProcessInstance,
    ) -> Result<bool> {
        let Some(event) = process.state.pending_connector_event() else {
            return Ok(false);
        };
        let tenant_id = services.config.tenant_id;

        let descriptor = match services
            .connectors
            .next_pending_connector(tx, ContainerRef::Process(process.id), event)
            .await?
        {
            Some(connector) => WorkDescriptor::new(WorkKind::ExecuteConnectorOfProcess {
                process_definition_id: process.process_definition_id,
                process_instance_id: process.id,
                root_process_instance_id: process.root_process_instance_id,
                connector_instance_id: connector.id,
                connector_definition_name: connector.name,
                activation_event: event,
            }),
            None => WorkDescriptor::resume_process(process.process_definition_id, process.id, event),
        };
        services.queue.enqueue(descriptor.with_tenant(tenant_id)).await?;
        Ok(true)
    }

    async fn notify_caller(
        &self,
        services: &Services,
        tx: TransactionId,
        process: &ProcessInstance,
    ) -> Result<bool> {
        let Some(caller_id) = process.caller_id else {
            return Ok(false);
        };
        // An interrupted called process is finished by the interrupting event.
        if process.interrupting_event_id.is_some() {
            return Ok(false);
        }
        let Some(caller) = services.flow_nodes.get_flow_node(tx, caller_id).await? else {
            debug!(process_instance_id = process.id, caller_id, "Caller no longer exists");
            return Ok(false);
        };
        if caller.terminal {
            return Ok(false);
        }

        let descriptor = WorkDescriptor::notify_child_finished(
            caller.process_definition_id,
            caller.parent_process_instance_id,
            FinishedChild::Process {
                process_instance_id: process.id,
                caller_id,
                state: process.state,
            },
        )
        .with_tenant(services.config.tenant_id);
        services.queue.enqueue(descriptor).await?;
        Ok(true)
    }

    async fn register_batch(
        &self,
        services: &Services,
        tx: TransactionId,
        ids: &[i64],
    ) -> Result<RestartReport> {
        let mut batch = RestartReport::default();
        for id in ids {
            let Some(process) = services.processes.get_process(tx, *id).await? else {
                continue;
            };
            match process.state {
                ProcessState::Initializing | ProcessState::Completing => {
                    if self.redrive(services, tx, &process).await? {
                        batch.processes_redriven += 1;
                    }
                }
                state if state.is_terminal() => {
                    if self.notify_caller(services, tx, &process).await? {
                        batch.callers_notified += 1;
                    }
                }
                // Moved on since discovery.
                _ => {}
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl RestartHandler for ProcessRestartHandler {
    fn name(&self) -> &'static str {
        "processes"
    }

    async fn handle_restart(&self, services: &Services, report: &mut RestartReport) -> Result<()> {
        let ids = self.discover(services).await?;
        info!(count = ids.len(), "Processes to restart");

        for chunk in ids.chunks(self.batch_size) {
            let tx = Transaction::begin(services.transactions.as_ref(), "restart processes").await?;
            let id = tx.id();
            let batch = tx.run(self.register_batch(services, id, chunk)).await?;
            report.processes_redriven += batch.processes_redriven;
            report.callers_notified += batch.callers_notified;
        }
        Ok(())
    }
}
