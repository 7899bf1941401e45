// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Re-registration of flow node works.

use super::{RestartHandler, RestartReport};
use crate::descriptor::{FinishedChild, WorkDescriptor};
use crate::error::Result;
use crate::fingerprint::StateFingerprint;
use crate::model::{FlowNodeInstance, FlowNodeKind};
use crate::persistence::{Transaction, TransactionId};
use crate::services::Services;
use async_trait::async_trait;
use tracing::{debug, info};

/// Registers a work for every flow node that was not archived before the
/// crash.
///
/// Terminal nodes get a `NOTIFY_CHILD_FINISHED` so their parent continues.
/// Other nodes get an `EXECUTE_FLOWNODE` carrying their current fingerprint,
/// except gateways whose merge condition is not fulfilled yet: those are
/// driven by the branches still to arrive.
pub struct FlowNodeRestartHandler {
    batch_size: usize,
}

enum Registration {
    Notified,
    Restarted,
    NotEligible,
    Gone,
}

impl FlowNodeRestartHandler {
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
            let tx = Transaction::begin(services.transactions.as_ref(), "list flow nodes to restart")
                .await?;
            let id = tx.id();
            let page = tx
                .run(services.flow_nodes.list_flow_nodes_to_restart(id, after_id, self.batch_size))
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

    async fn register(
        &self,
        services: &Services,
        tx: TransactionId,
        id: i64,
    ) -> Result<Registration> {
        let Some(node) = services.flow_nodes.get_flow_node(tx, id).await? else {
            return Ok(Registration::Gone);
        };
        let tenant_id = services.config.tenant_id;

        if node.terminal {
            let descriptor = WorkDescriptor::notify_child_finished(
                node.process_definition_id,
                node.parent_process_instance_id,
                FinishedChild::FlowNode {
                    flow_node_instance_id: node.id,
                    fingerprint: StateFingerprint::of(&node),
                },
            )
            .with_tenant(tenant_id);
            services.queue.enqueue(descriptor).await?;
            return Ok(Registration::Notified);
        }

        if !self.is_eligible(services, tx, &node).await? {
            return Ok(Registration::NotEligible);
        }

        let descriptor = WorkDescriptor::execute_flow_node(
            node.process_definition_id,
            node.parent_process_instance_id,
            node.id,
            StateFingerprint::of(&node),
        )
        .with_tenant(tenant_id);
        services.queue.enqueue(descriptor).await?;
        Ok(Registration::Restarted)
    }

    async fn is_eligible(
        &self,
        services: &Services,
        tx: TransactionId,
        node: &FlowNodeInstance,
    ) -> Result<bool> {
        match node.kind {
            FlowNodeKind::Gateway => {
                services
                    .flow_node_executor
                    .is_merge_condition_fulfilled(tx, node)
                    .await
            }
            _ => Ok(true),
        }
    }

    async fn register_batch(
        &self,
        services: &Services,
        tx: TransactionId,
        ids: &[i64],
    ) -> Result<RestartReport> {
        let mut batch = RestartReport::default();
        for id in ids {
            match self.register(services, tx, *id).await? {
                Registration::Notified => batch.flow_nodes_notified += 1,
                Registration::Restarted => batch.flow_nodes_restarted += 1,
                Registration::NotEligible => {
                    debug!(flow_node_instance_id = id, "Gateway merge condition not fulfilled");
                    batch.flow_nodes_not_eligible += 1;
                }
                Registration::Gone => {
                    debug!(flow_node_instance_id = id, "Flow node disappeared during restart");
                }
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl RestartHandler for FlowNodeRestartHandler {
    fn name(&self) -> &'static str {
        "flow-nodes"
    }

    async fn handle_restart(&self, services: &Services, report: &mut RestartReport) -> Result<()> {
        let ids = self.discover(services).await?;
        info!(count = ids.len(), "Flow nodes to restart");

        for chunk in ids.chunks(self.batch_size) {
            let tx = Transaction::begin(services.transactions.as_ref(), "restart flow nodes").await?;
            let id = tx.id();
            let batch = tx.run(self.register_batch(services, id, chunk)).await?;
            report.flow_nodes_notified += batch.flow_nodes_notified;
            report.flow_nodes_restarted += batch.flow_nodes_restarted;
            report.flow_nodes_not_eligible += batch.flow_nodes_not_eligible;
        }
        Ok(())
    }
}
