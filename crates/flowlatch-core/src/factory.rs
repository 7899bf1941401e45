// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Materializes work descriptors into decorated works.
//!
//! | Descriptor                        | Lock                     | Transaction     |
//! |-----------------------------------|--------------------------|-----------------|
//! | `EXECUTE_FLOWNODE`                | bounded wait             | whole work      |
//! | `NOTIFY_CHILD_FINISHED`           | reject and requeue       | whole work      |
//! | `EXECUTE_CONNECTOR_OF_ACTIVITY`   | bounded wait, last phase | per phase       |
//! | `EXECUTE_CONNECTOR_OF_PROCESS`    | bounded wait, last phase | per phase       |
//! | `EXECUTE_MESSAGE_COUPLE`          | none                     | whole work      |
//! | `TRIGGER_SIGNAL`                  | none                     | whole work      |
//! | `INSTANTIATE_PROCESS`             | none                     | whole work      |
//! | `RESUME_PROCESS`                  | bounded wait             | whole work      |
//!
//! Every stack is wrapped in session binding and failure handling.

use crate::config::Config;
use crate::descriptor::{FinishedChild, WorkDescriptor, WorkKind};
use crate::execution::{
    ExecuteConnectorWork, ExecuteFlowNodeWork, ExecuteMessageCoupleWork, InstantiateProcessWork,
    NotifyChildFinishedWork, ResumeProcessWork, TriggerSignalWork,
};
use crate::lock::LockKey;
use crate::work::{BoxedWork, WorkChain, keys};
use std::time::Duration;

/// Builds decorated works from descriptors.
#[derive(Debug, Clone)]
pub struct WorkFactory {
    lock_timeout: Duration,
}

impl WorkFactory {
    /// Factory using the configured lock timeout.
    pub fn new(config: &Config) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
        }
    }

    /// Build the decorated work for a descriptor.
    pub fn create(&self, descriptor: &WorkDescriptor) -> BoxedWork {
        let tenant_id = descriptor.tenant_id;

        let chain = match &descriptor.kind {
            WorkKind::ExecuteFlowNode {
                process_definition_id,
                process_instance_id,
                flow_node_instance_id,
                fingerprint,
            } => WorkChain::new(ExecuteFlowNodeWork::new(
                *process_definition_id,
                *process_instance_id,
                *flow_node_instance_id,
                *fingerprint,
            ))
            .annotated(vec![
                (keys::PROCESS_DEFINITION_ID, process_definition_id.to_string()),
                (keys::PROCESS_INSTANCE_ID, process_instance_id.to_string()),
                (keys::FLOW_NODE_INSTANCE_ID, flow_node_instance_id.to_string()),
            ])
            .in_transaction(),

            WorkKind::NotifyChildFinished {
                process_definition_id,
                parent_process_instance_id,
                child,
            } => {
                let mut annotations = vec![
                    (keys::PROCESS_DEFINITION_ID, process_definition_id.to_string()),
                    (keys::PROCESS_INSTANCE_ID, parent_process_instance_id.to_string()),
                ];
                match child {
                    FinishedChild::FlowNode {
                        flow_node_instance_id,
                        ..
                    } => annotations.push((keys::FLOW_NODE_INSTANCE_ID, flow_node_instance_id.to_string())),
                    FinishedChild::Process { caller_id, .. } => {
                        annotations.push((keys::FLOW_NODE_INSTANCE_ID, caller_id.to_string()))
                    }
                }
                WorkChain::new(NotifyChildFinishedWork::new(
                    *process_definition_id,
                    *parent_process_instance_id,
                    child.clone(),
                ))
                .annotated(annotations)
                .in_transaction()
            }

            WorkKind::ExecuteConnectorOfActivity {
                process_definition_id,
                process_instance_id,
                root_process_instance_id,
                flow_node_instance_id,
                connector_instance_id,
                connector_definition_name,
            } => WorkChain::new(ExecuteConnectorWork::of_activity(
                *process_definition_id,
                *process_instance_id,
                *root_process_instance_id,
                *flow_node_instance_id,
                *connector_instance_id,
                connector_definition_name.clone(),
            ))
            .annotated(vec![
                (keys::CONNECTOR_INSTANCE_ID, connector_instance_id.to_string()),
                (keys::CONNECTOR_DEFINITION_NAME, connector_definition_name.clone()),
            ])
            .annotated(vec![
                (keys::PROCESS_DEFINITION_ID, process_definition_id.to_string()),
                (keys::PROCESS_INSTANCE_ID, process_instance_id.to_string()),
                (keys::ROOT_PROCESS_INSTANCE_ID, root_process_instance_id.to_string()),
                (keys::FLOW_NODE_INSTANCE_ID, flow_node_instance_id.to_string()),
            ]),

            WorkKind::ExecuteConnectorOfProcess {
                process_definition_id,
                process_instance_id,
                root_process_instance_id,
                connector_instance_id,
                connector_definition_name,
                activation_event,
            } => WorkChain::new(ExecuteConnectorWork::of_process(
                *process_definition_id,
                *process_instance_id,
                *root_process_instance_id,
                *connector_instance_id,
                connector_definition_name.clone(),
                *activation_event,
            ))
            .annotated(vec![
                (keys::CONNECTOR_INSTANCE_ID, connector_instance_id.to_string()),
                (keys::CONNECTOR_DEFINITION_NAME, connector_definition_name.clone()),
                (keys::CONNECTOR_ACTIVATION_EVENT, activation_event.to_string()),
            ])
            .annotated(vec![
                (keys::PROCESS_DEFINITION_ID, process_definition_id.to_string()),
                (keys::PROCESS_INSTANCE_ID, process_instance_id.to_string()),
                (keys::ROOT_PROCESS_INSTANCE_ID, root_process_instance_id.to_string()),
            ]),

            WorkKind::ExecuteMessageCouple {
                message_instance_id,
                waiting_message_id,
            } => WorkChain::new(ExecuteMessageCoupleWork::new(
                *message_instance_id,
                *waiting_message_id,
            ))
            .annotated(vec![
                (keys::MESSAGE_INSTANCE_ID, message_instance_id.to_string()),
                (keys::WAITING_EVENT_ID, waiting_message_id.to_string()),
            ])
            .in_transaction(),

            WorkKind::TriggerSignal {
                waiting_signal_id,
                signal_name,
            } => WorkChain::new(TriggerSignalWork::new(*waiting_signal_id, signal_name.clone()))
                .annotated(vec![(keys::WAITING_EVENT_ID, waiting_signal_id.to_string())])
                .in_transaction(),

            WorkKind::InstantiateProcess {
                process_definition_id,
                start_flow_node,
                message,
                instantiation_token,
            } => {
                let mut annotations = vec![
                    (keys::PROCESS_DEFINITION_ID, process_definition_id.to_string()),
                    (keys::INSTANTIATION_TOKEN, instantiation_token.to_string()),
                ];
                if let Some(couple) = message {
                    annotations.push((keys::MESSAGE_INSTANCE_ID, couple.message_instance_id.to_string()));
                    annotations.push((keys::WAITING_EVENT_ID, couple.waiting_message_id.to_string()));
                }
                WorkChain::new(InstantiateProcessWork::new(
                    *process_definition_id,
                    start_flow_node.clone(),
                    *message,
                    *instantiation_token,
                ))
                .annotated(annotations)
                .in_transaction()
            }

            WorkKind::ResumeProcess {
                process_definition_id,
                process_instance_id,
                activation_event,
            } => WorkChain::new(ResumeProcessWork::new(
                *process_definition_id,
                *process_instance_id,
                *activation_event,
            ))
            .annotated(vec![
                (keys::PROCESS_DEFINITION_ID, process_definition_id.to_string()),
                (keys::PROCESS_INSTANCE_ID, process_instance_id.to_string()),
            ])
            .in_transaction(),
        };

        let chain = match (LockPolicy::of(&descriptor.kind), descriptor.locked_process_instance_id()) {
            (LockPolicy::Wait, Some(process_instance_id)) => chain.locked(
                LockKey::process_instance(process_instance_id, tenant_id),
                self.lock_timeout,
            ),
            (LockPolicy::Requeue, Some(process_instance_id)) => chain.locked_or_requeued(
                LockKey::process_instance(process_instance_id, tenant_id),
                descriptor.clone(),
            ),
            _ => chain,
        };

        chain.with_session().with_failure_handling().build()
    }
}

/// How the chain takes the process-instance lock.
enum LockPolicy {
    /// Bounded wait around the whole work.
    Wait,
    /// No wait: park the descriptor until the holder releases.
    Requeue,
    /// No lock in the chain. Connectors lock their last phase themselves.
    None,
}

impl LockPolicy {
    fn of(kind: &WorkKind) -> Self {
        match kind {
            WorkKind::ExecuteFlowNode { .. } | WorkKind::ResumeProcess { .. } => LockPolicy::Wait,
            WorkKind::NotifyChildFinished { .. } => LockPolicy::Requeue,
            WorkKind::ExecuteConnectorOfActivity { .. }
            | WorkKind::ExecuteConnectorOfProcess { .. }
            | WorkKind::ExecuteMessageCouple { .. }
            | WorkKind::TriggerSignal { .. }
            | WorkKind::InstantiateProcess { .. } => LockPolicy::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::StateFingerprint;
    use crate::model::ConnectorEvent;
    use crate::lock::LockService;
    use crate::testing::{NoopEngine, test_services};
    use crate::work::{Outcome, WorkContext};
    use std::sync::Arc;

    #[test]
    fn test_descriptions_name_the_entities() {
        let factory = WorkFactory::new(&Config::default());

        let work = factory.create(&WorkDescriptor::execute_flow_node(
            7,
            10,
            42,
            StateFingerprint::stable(3),
        ));
        assert!(work.description().contains("flow node 42"));
        assert!(work.recovery_procedure().contains("42"));

        let work = factory.create(&WorkDescriptor::new(WorkKind::ExecuteConnectorOfProcess {
            process_definition_id: 7,
            process_instance_id: 10,
            root_process_instance_id: 10,
            connector_instance_id: 5,
            connector_definition_name: "email".to_string(),
            activation_event: ConnectorEvent::OnEnter,
        }));
        assert!(work.description().contains("'email'"));
        assert!(work.description().contains("process 10"));

        let work = factory.create(&WorkDescriptor::resume_process(7, 10, ConnectorEvent::OnFinish));
        assert!(work.description().contains("ON_FINISH"));
    }

    #[tokio::test]
    async fn test_chain_locks_the_descriptor_process() {
        let (services, _, _) = test_services(Arc::new(NoopEngine));
        let factory = WorkFactory::new(&Config::default());
        let held = services
            .locks
            .try_lock(&LockKey::process_instance(10, Some(3)), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let resume = WorkDescriptor::resume_process(7, 10, ConnectorEvent::OnFinish).with_tenant(Some(3));
        let mut ctx = WorkContext::new(services.clone(), Some(3));
        match factory.create(&resume).execute(&mut ctx).await.unwrap() {
            Outcome::Retry { cause } => assert_eq!(cause.error_code(), "LOCK_TIMEOUT"),
            other => panic!("unexpected outcome {other:?}"),
        }

        let notify = WorkDescriptor::notify_child_finished(
            7,
            10,
            FinishedChild::FlowNode {
                flow_node_instance_id: 43,
                fingerprint: StateFingerprint::stable(2),
            },
        )
        .with_tenant(Some(3));
        let mut ctx = WorkContext::new(services.clone(), Some(3));
        let outcome = factory.create(&notify).execute(&mut ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Deferred { resource } if resource == LockKey::process_instance(10, Some(3))));

        // Another tenant's process 10 is a different lock.
        let mut ctx = WorkContext::new(services.clone(), None);
        let outcome = factory
            .create(&WorkDescriptor::resume_process(7, 10, ConnectorEvent::OnFinish))
            .execute(&mut ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Skipped { .. }));

        services.locks.unlock(held).unwrap();
    }
}
