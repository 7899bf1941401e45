// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector execution.
//!
//! A connector call may take long, so it never runs inside a transaction or
//! while the process instance is locked:
//!
//! 1. **Prepare** (transaction): load the connector, mark it EXECUTING and
//!    evaluate its inputs.
//! 2. **Execute** (no transaction, no lock): call the connector with a
//!    timeout.
//! 3. **Complete** (process lock, then transaction): apply outputs, mark the
//!    connector DONE and continue the container.
//!
//! When any phase fails, the connector's fail action decides what happens to
//! its container. If applying the fail action fails as well, both the
//! connector and its container are set to FAILED as a last resort.

use super::FailedStateSetter;
use crate::error::{Result, WorkError};
use crate::lock::{LockGuard, LockKey};
use crate::model::{
    ConnectorEvent, ConnectorFailure, ConnectorInstance, ConnectorPhase, ConnectorState,
    ContainerRef, FailAction, ProcessState,
};
use crate::persistence::{Transaction, TransactionId};
use crate::services::{ConnectorInputs, ErrorEventHandling, Services};
use crate::work::{Outcome, Work, WorkContext};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

/// Error code thrown when a connector with [`FailAction::ErrorEvent`] has none.
pub const DEFAULT_CONNECTOR_ERROR_CODE: &str = "CONNECTOR_FAILED";

/// What a connector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorTarget {
    /// An activity of the process instance.
    Activity {
        /// The activity.
        flow_node_instance_id: i64,
    },
    /// The process instance itself.
    Process {
        /// Phase of the process the connector belongs to.
        activation_event: ConnectorEvent,
    },
}

/// How a connector failure was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailActionResolution {
    /// The connector no longer exists.
    ConnectorGone,
    /// Connector and container failed.
    ContainerFailed,
    /// Connector failed, container continued.
    Ignored,
    /// An error event was thrown and caught.
    ErrorEventCaught,
}

enum Prepared {
    Ready(ConnectorInstance, ConnectorInputs),
    Skip(String),
}

/// Runs one connector of an activity or a process.
#[derive(Debug, Clone)]
pub struct ExecuteConnectorWork {
    process_definition_id: i64,
    process_instance_id: i64,
    root_process_instance_id: i64,
    connector_instance_id: i64,
    connector_definition_name: String,
    target: ConnectorTarget,
}

impl ExecuteConnectorWork {
    /// Connector attached to an activity.
    pub fn of_activity(
        process_definition_id: i64,
        process_instance_id: i64,
        root_process_instance_id: i64,
        flow_node_instance_id: i64,
        connector_instance_id: i64,
        connector_definition_name: impl Into<String>,
    ) -> Self {
        Self {
            process_definition_id,
            process_instance_id,
            root_process_instance_id,
            connector_instance_id,
            connector_definition_name: connector_definition_name.into(),
            target: ConnectorTarget::Activity {
                flow_node_instance_id,
            },
        }
    }

    /// Connector attached to a process.
    pub fn of_process(
        process_definition_id: i64,
        process_instance_id: i64,
        root_process_instance_id: i64,
        connector_instance_id: i64,
        connector_definition_name: impl Into<String>,
        activation_event: ConnectorEvent,
    ) -> Self {
        Self {
            process_definition_id,
            process_instance_id,
            root_process_instance_id,
            connector_instance_id,
            connector_definition_name: connector_definition_name.into(),
            target: ConnectorTarget::Process { activation_event },
        }
    }

    fn container(&self) -> ContainerRef {
        match self.target {
            ConnectorTarget::Activity {
                flow_node_instance_id,
            } => ContainerRef::Activity(flow_node_instance_id),
            ConnectorTarget::Process { .. } => ContainerRef::Process(self.process_instance_id),
        }
    }

    fn lock_key(&self, tenant_id: Option<i64>) -> LockKey {
        LockKey::process_instance(self.process_instance_id, tenant_id)
    }

    async fn prepare(&self, services: &Services, tx: TransactionId) -> Result<Prepared> {
        let Some(connector) = services.connectors.get_connector(tx, self.connector_instance_id).await? else {
            return Ok(Prepared::Skip(format!(
                "Connector instance {} not found",
                self.connector_instance_id
            )));
        };
        if connector.state.is_terminal() {
            return Ok(Prepared::Skip(format!(
                "Connector instance {} is already {}",
                self.connector_instance_id, connector.state
            )));
        }

        services
            .connectors
            .set_connector_state(tx, connector.id, ConnectorState::Executing)
            .await?;
        let inputs = services
            .connector_executor
            .evaluate_inputs(tx, &connector)
            .await
            .map_err(|e| WorkError::connector(ConnectorPhase::EvaluateInputs, e))?;

        Ok(Prepared::Ready(connector, inputs))
    }

    async fn complete(
        &self,
        services: &Services,
        tx: TransactionId,
        connector: &ConnectorInstance,
        outputs: crate::services::ConnectorOutputs,
    ) -> Result<()> {
        services
            .connector_executor
            .apply_outputs(tx, connector, outputs)
            .await
            .map_err(|e| WorkError::connector(ConnectorPhase::ApplyOutputs, e))?;
        services
            .connectors
            .set_connector_state(tx, connector.id, ConnectorState::Done)
            .await?;
        self.continue_container(services, tx, connector.activation_event).await
    }

    async fn continue_container(
        &self,
        services: &Services,
        tx: TransactionId,
        event: ConnectorEvent,
    ) -> Result<()> {
        match self.target {
            ConnectorTarget::Activity {
                flow_node_instance_id,
            } => {
                let flow_node = services
                    .flow_nodes
                    .get_flow_node(tx, flow_node_instance_id)
                    .await?
                    .ok_or_else(|| WorkError::not_found("flow node", flow_node_instance_id))?;
                services
                    .flow_node_executor
                    .continue_after_connector(tx, &flow_node, event)
                    .await
            }
            ConnectorTarget::Process { .. } => {
                let process = services
                    .processes
                    .get_process(tx, self.process_instance_id)
                    .await?
                    .ok_or_else(|| WorkError::not_found("process instance", self.process_instance_id))?;
                services
                    .process_executor
                    .continue_after_connectors(tx, &process, event)
                    .await
            }
        }
    }

    async fn set_container_failed(&self, services: &Services, tx: TransactionId) -> Result<()> {
        match self.target {
            ConnectorTarget::Activity {
                flow_node_instance_id,
            } => {
                FailedStateSetter::new(services, tx)
                    .set_as_failed(flow_node_instance_id, None)
                    .await?;
            }
            ConnectorTarget::Process { .. } => {
                services
                    .processes
                    .set_process_state(tx, self.process_instance_id, ProcessState::Error)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_fail_action(
        &self,
        services: &Services,
        tx: TransactionId,
        failure: ConnectorFailure,
    ) -> Result<FailActionResolution> {
        let Some(connector) = services.connectors.get_connector(tx, self.connector_instance_id).await? else {
            return Ok(FailActionResolution::ConnectorGone);
        };

        services
            .connectors
            .record_connector_failure(tx, connector.id, failure)
            .await?;

        match connector.fail_action {
            FailAction::Fail => {
                self.set_container_failed(services, tx).await?;
                Ok(FailActionResolution::ContainerFailed)
            }
            FailAction::Ignore => {
                self.continue_container(services, tx, connector.activation_event)
                    .await?;
                Ok(FailActionResolution::Ignored)
            }
            FailAction::ErrorEvent => {
                let error_code = connector
                    .error_code
                    .as_deref()
                    .unwrap_or(DEFAULT_CONNECTOR_ERROR_CODE);
                match services
                    .events_handler
                    .throw_error_event(tx, self.container(), error_code)
                    .await?
                {
                    ErrorEventHandling::Caught => Ok(FailActionResolution::ErrorEventCaught),
                    ErrorEventHandling::NotCaught => {
                        warn!(
                            connector_instance_id = connector.id,
                            error_code, "Error event not caught, failing the container"
                        );
                        self.set_container_failed(services, tx).await?;
                        Ok(FailActionResolution::ContainerFailed)
                    }
                }
            }
        }
    }

    async fn set_connector_and_container_failed(
        &self,
        services: &Services,
        tx: TransactionId,
        failure: ConnectorFailure,
    ) -> Result<()> {
        if services
            .connectors
            .get_connector(tx, self.connector_instance_id)
            .await?
            .is_some()
        {
            services
                .connectors
                .record_connector_failure(tx, self.connector_instance_id, failure)
                .await?;
        }
        self.set_container_failed(services, tx).await
    }

    /// Bounded-wait lock on the process instance the connector belongs to.
    async fn lock_process<'s>(
        &self,
        services: &'s Services,
        tenant_id: Option<i64>,
    ) -> Result<LockGuard<'s>> {
        let key = self.lock_key(tenant_id);
        let timeout = services.config.lock_timeout;
        match services.locks.try_lock(&key, timeout).await? {
            Some(lock) => Ok(LockGuard::new(services.locks.as_ref(), lock)),
            None => Err(WorkError::LockTimeout {
                resource: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl Work for ExecuteConnectorWork {
    #[instrument(skip(self, ctx), fields(connector_instance_id = self.connector_instance_id, connector = %self.connector_definition_name))]
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        let services = ctx.services_arc();

        // 1. Prepare
        let tx = Transaction::begin(services.transactions.as_ref(), "prepare connector").await?;
        let id = tx.id();
        let (connector, inputs) = match tx.run(self.prepare(&services, id)).await? {
            Prepared::Ready(connector, inputs) => (connector, inputs),
            Prepared::Skip(reason) => return Ok(Outcome::Skipped { reason }),
        };

        // 2. Execute, outside any transaction
        debug!(inputs = inputs.len(), "Calling connector");
        let timeout = services.config.connector_timeout;
        let outputs = match tokio::time::timeout(
            timeout,
            services.connector_executor.execute(&connector, inputs),
        )
        .await
        {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(e)) => return Err(WorkError::connector(ConnectorPhase::Execute, e)),
            Err(_) => {
                return Err(WorkError::Connector {
                    phase: ConnectorPhase::Execute,
                    message: format!("timed out after {}s", timeout.as_secs()),
                });
            }
        };

        // 3. Complete under the process lock
        let guard = self.lock_process(&services, ctx.tenant_id()).await?;
        let tx = Transaction::begin(services.transactions.as_ref(), "complete connector").await?;
        let id = tx.id();
        let completed = tx.run(self.complete(&services, id, &connector, outputs)).await;
        drop(guard);
        completed?;

        info!("Connector executed");
        Ok(Outcome::Completed)
    }

    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        let services = ctx.services_arc();
        let tenant_id = ctx.tenant_id();
        let failure = ConnectorFailure {
            phase: match error {
                WorkError::Connector { phase, .. } => Some(*phase),
                _ => None,
            },
            message: error.to_string(),
            recorded_at: Utc::now(),
        };

        let applied = {
            let guard = self.lock_process(&services, tenant_id).await?;
            let tx =
                Transaction::begin(services.transactions.as_ref(), "apply connector fail action").await?;
            let id = tx.id();
            let applied = tx
                .run(self.apply_fail_action(&services, id, failure.clone()))
                .await;
            drop(guard);
            applied
        };

        match applied {
            Ok(resolution) => {
                info!(
                    connector_instance_id = self.connector_instance_id,
                    ?resolution,
                    "Connector fail action applied"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    connector_instance_id = self.connector_instance_id,
                    error = %e,
                    "Unable to apply connector fail action, setting connector and container to failed"
                );
                let guard = self.lock_process(&services, tenant_id).await?;
                let tx =
                    Transaction::begin(services.transactions.as_ref(), "fail connector and container").await?;
                let id = tx.id();
                let failed = tx
                    .run(self.set_connector_and_container_failed(&services, id, failure))
                    .await;
                drop(guard);
                failed
            }
        }
    }

    fn description(&self) -> String {
        format!(
            "Execute connector '{}' (instance {}) of {} in process instance {} (root {}, definition {})",
            self.connector_definition_name,
            self.connector_instance_id,
            self.container(),
            self.process_instance_id,
            self.root_process_instance_id,
            self.process_definition_id
        )
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Fix connector '{}' (instance {}), then replay it or set {} to failed by hand",
            self.connector_definition_name,
            self.connector_instance_id,
            self.container()
        )
    }
}
