// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serializable work descriptors.
//!
//! A [`WorkDescriptor`] is what travels through the work queue: a type tag and
//! a flat set of identifiers. The [`crate::factory::WorkFactory`] turns it
//! back into an executable, decorated work on the worker side.
//!
//! Wire format (JSON):
//!
//! ```json
//! {"tenant_id":1,"type":"EXECUTE_FLOWNODE","process_definition_id":7,
//!  "process_instance_id":10,"flow_node_instance_id":42,
//!  "fingerprint":{"state_id":3,"executing":false,"aborting":false,"canceling":false}}
//! ```

use crate::error::{Result, WorkError};
use crate::fingerprint::StateFingerprint;
use crate::model::{ConnectorEvent, ProcessState};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A serializable request to execute one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    /// Tenant the work runs for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<i64>,
    /// What to execute.
    #[serde(flatten)]
    pub kind: WorkKind,
}

/// The kinds of work the core knows how to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkKind {
    /// Advance a flow node one step.
    #[serde(rename = "EXECUTE_FLOWNODE")]
    ExecuteFlowNode {
        /// Process definition.
        process_definition_id: i64,
        /// Process instance holding the node.
        process_instance_id: i64,
        /// Flow node to execute.
        flow_node_instance_id: i64,
        /// State the node had when the work was registered.
        fingerprint: StateFingerprint,
    },
    /// Tell a parent process that a child finished.
    NotifyChildFinished {
        /// Definition of the parent process.
        process_definition_id: i64,
        /// Process instance to notify.
        parent_process_instance_id: i64,
        /// The child that finished.
        child: FinishedChild,
    },
    /// Run a connector attached to an activity.
    ExecuteConnectorOfActivity {
        /// Process definition.
        process_definition_id: i64,
        /// Process instance holding the activity.
        process_instance_id: i64,
        /// Top-level process instance.
        root_process_instance_id: i64,
        /// Activity the connector belongs to.
        flow_node_instance_id: i64,
        /// Connector to run.
        connector_instance_id: i64,
        /// Connector definition name.
        connector_definition_name: String,
    },
    /// Run a connector attached to a process.
    ExecuteConnectorOfProcess {
        /// Process definition.
        process_definition_id: i64,
        /// Process instance the connector belongs to.
        process_instance_id: i64,
        /// Top-level process instance.
        root_process_instance_id: i64,
        /// Connector to run.
        connector_instance_id: i64,
        /// Connector definition name.
        connector_definition_name: String,
        /// Phase of the process the connector belongs to.
        activation_event: ConnectorEvent,
    },
    /// Deliver a matched message to its waiting event.
    ExecuteMessageCouple {
        /// Message instance.
        message_instance_id: i64,
        /// Waiting message event.
        waiting_message_id: i64,
    },
    /// Deliver a signal to one waiting event.
    TriggerSignal {
        /// Waiting signal event.
        waiting_signal_id: i64,
        /// Signal name.
        signal_name: String,
    },
    /// Start a new process instance.
    InstantiateProcess {
        /// Definition to instantiate.
        process_definition_id: i64,
        /// Start element, when not the default start.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_flow_node: Option<String>,
        /// Message that triggered the start, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessageCouple>,
        /// Drawn when the descriptor is built; redeliveries carry the same one.
        instantiation_token: Uuid,
    },
    /// Continue a process whose connectors for a phase have all finished.
    ResumeProcess {
        /// Process definition.
        process_definition_id: i64,
        /// Process instance to resume.
        process_instance_id: i64,
        /// Phase the process was in.
        activation_event: ConnectorEvent,
    },
}

/// A child whose completion must be reported to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinishedChild {
    /// A flow node that reached a terminal state.
    FlowNode {
        /// Finished flow node.
        flow_node_instance_id: i64,
        /// Terminal state it had when the work was registered.
        fingerprint: StateFingerprint,
    },
    /// A called process that reached a terminal state.
    Process {
        /// Finished process.
        process_instance_id: i64,
        /// Call activity waiting for it.
        caller_id: i64,
        /// Terminal state it had when the work was registered.
        state: ProcessState,
    },
}

/// A message matched to a waiting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCouple {
    /// Message instance.
    pub message_instance_id: i64,
    /// Waiting message event.
    pub waiting_message_id: i64,
}

/// A single descriptor parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Integer identifier or counter.
    Int(i64),
    /// Name or enumeration value.
    Str(String),
    /// Flag.
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Str(v) => f.write_str(v),
            ParamValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl WorkDescriptor {
    /// Wraps a work kind with no tenant.
    pub fn new(kind: WorkKind) -> Self {
        Self {
            tenant_id: None,
            kind,
        }
    }

    /// Sets the tenant the work runs for.
    pub fn with_tenant(mut self, tenant_id: Option<i64>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Describes an `EXECUTE_FLOWNODE` work.
    pub fn execute_flow_node(
        process_definition_id: i64,
        process_instance_id: i64,
        flow_node_instance_id: i64,
        fingerprint: StateFingerprint,
    ) -> Self {
        Self::new(WorkKind::ExecuteFlowNode {
            process_definition_id,
            process_instance_id,
            flow_node_instance_id,
            fingerprint,
        })
    }

    /// Describes a `NOTIFY_CHILD_FINISHED` work.
    pub fn notify_child_finished(
        process_definition_id: i64,
        parent_process_instance_id: i64,
        child: FinishedChild,
    ) -> Self {
        Self::new(WorkKind::NotifyChildFinished {
            process_definition_id,
            parent_process_instance_id,
            child,
        })
    }

    /// Describes an `EXECUTE_MESSAGE_COUPLE` work.
    pub fn execute_message_couple(message_instance_id: i64, waiting_message_id: i64) -> Self {
        Self::new(WorkKind::ExecuteMessageCouple {
            message_instance_id,
            waiting_message_id,
        })
    }

    /// Describes a `TRIGGER_SIGNAL` work.
    pub fn trigger_signal(waiting_signal_id: i64, signal_name: impl Into<String>) -> Self {
        Self::new(WorkKind::TriggerSignal {
            waiting_signal_id,
            signal_name: signal_name.into(),
        })
    }

    /// Describes an `INSTANTIATE_PROCESS` work under a fresh instantiation
    /// token.
    pub fn instantiate_process(
        process_definition_id: i64,
        start_flow_node: Option<String>,
        message: Option<MessageCouple>,
    ) -> Self {
        Self::new(WorkKind::InstantiateProcess {
            process_definition_id,
            start_flow_node,
            message,
            instantiation_token: Uuid::new_v4(),
        })
    }

    /// Describes a `RESUME_PROCESS` work.
    pub fn resume_process(
        process_definition_id: i64,
        process_instance_id: i64,
        activation_event: ConnectorEvent,
    ) -> Self {
        Self::new(WorkKind::ResumeProcess {
            process_definition_id,
            process_instance_id,
            activation_event,
        })
    }

    /// Type tag as it appears on the wire.
    pub fn type_tag(&self) -> &'static str {
        match &self.kind {
            WorkKind::ExecuteFlowNode { .. } => "EXECUTE_FLOWNODE",
            WorkKind::NotifyChildFinished { .. } => "NOTIFY_CHILD_FINISHED",
            WorkKind::ExecuteConnectorOfActivity { .. } => "EXECUTE_CONNECTOR_OF_ACTIVITY",
            WorkKind::ExecuteConnectorOfProcess { .. } => "EXECUTE_CONNECTOR_OF_PROCESS",
            WorkKind::ExecuteMessageCouple { .. } => "EXECUTE_MESSAGE_COUPLE",
            WorkKind::TriggerSignal { .. } => "TRIGGER_SIGNAL",
            WorkKind::InstantiateProcess { .. } => "INSTANTIATE_PROCESS",
            WorkKind::ResumeProcess { .. } => "RESUME_PROCESS",
        }
    }

    /// Process instance whose lock guards this work, if any.
    pub fn locked_process_instance_id(&self) -> Option<i64> {
        match &self.kind {
            WorkKind::ExecuteFlowNode {
                process_instance_id,
                ..
            }
            | WorkKind::ExecuteConnectorOfActivity {
                process_instance_id,
                ..
            }
            | WorkKind::ExecuteConnectorOfProcess {
                process_instance_id,
                ..
            }
            | WorkKind::ResumeProcess {
                process_instance_id,
                ..
            } => Some(*process_instance_id),
            WorkKind::NotifyChildFinished {
                parent_process_instance_id,
                ..
            } => Some(*parent_process_instance_id),
            WorkKind::ExecuteMessageCouple { .. }
            | WorkKind::TriggerSignal { .. }
            | WorkKind::InstantiateProcess { .. } => None,
        }
    }

    /// Flat, ordered view of the descriptor parameters.
    pub fn parameters(&self) -> Vec<(&'static str, ParamValue)> {
        use ParamValue::{Int, Str};

        let mut params = Vec::new();
        if let Some(tenant_id) = self.tenant_id {
            params.push(("tenant_id", Int(tenant_id)));
        }

        match &self.kind {
            WorkKind::ExecuteFlowNode {
                process_definition_id,
                process_instance_id,
                flow_node_instance_id,
                fingerprint,
            } => {
                params.push(("process_definition_id", Int(*process_definition_id)));
                params.push(("process_instance_id", Int(*process_instance_id)));
                params.push(("flow_node_instance_id", Int(*flow_node_instance_id)));
                push_fingerprint(&mut params, fingerprint);
            }
            WorkKind::NotifyChildFinished {
                process_definition_id,
                parent_process_instance_id,
                child,
            } => {
                params.push(("process_definition_id", Int(*process_definition_id)));
                params.push((
                    "parent_process_instance_id",
                    Int(*parent_process_instance_id),
                ));
                match child {
                    FinishedChild::FlowNode {
                        flow_node_instance_id,
                        fingerprint,
                    } => {
                        params.push(("flow_node_instance_id", Int(*flow_node_instance_id)));
                        push_fingerprint(&mut params, fingerprint);
                    }
                    FinishedChild::Process {
                        process_instance_id,
                        caller_id,
                        state,
                    } => {
                        params.push(("child_process_instance_id", Int(*process_instance_id)));
                        params.push(("caller_id", Int(*caller_id)));
                        params.push(("child_state", Str(state.to_string())));
                    }
                }
            }
            WorkKind::ExecuteConnectorOfActivity {
                process_definition_id,
                process_instance_id,
                root_process_instance_id,
                flow_node_instance_id,
                connector_instance_id,
                connector_definition_name,
            } => {
                params.push(("process_definition_id", Int(*process_definition_id)));
                params.push(("process_instance_id", Int(*process_instance_id)));
                params.push(("root_process_instance_id", Int(*root_process_instance_id)));
                params.push(("flow_node_instance_id", Int(*flow_node_instance_id)));
                params.push(("connector_instance_id", Int(*connector_instance_id)));
                params.push((
                    "connector_definition_name",
                    Str(connector_definition_name.clone()),
                ));
            }
            WorkKind::ExecuteConnectorOfProcess {
                process_definition_id,
                process_instance_id,
                root_process_instance_id,
                connector_instance_id,
                connector_definition_name,
                activation_event,
            } => {
                params.push(("process_definition_id", Int(*process_definition_id)));
                params.push(("process_instance_id", Int(*process_instance_id)));
                params.push(("root_process_instance_id", Int(*root_process_instance_id)));
                params.push(("connector_instance_id", Int(*connector_instance_id)));
                params.push((
                    "connector_definition_name",
                    Str(connector_definition_name.clone()),
                ));
                params.push(("activation_event", Str(activation_event.to_string())));
            }
            WorkKind::ExecuteMessageCouple {
                message_instance_id,
                waiting_message_id,
            } => {
                params.push(("message_instance_id", Int(*message_instance_id)));
                params.push(("waiting_message_id", Int(*waiting_message_id)));
            }
            WorkKind::TriggerSignal {
                waiting_signal_id,
                signal_name,
            } => {
                params.push(("waiting_signal_id", Int(*waiting_signal_id)));
                params.push(("signal_name", Str(signal_name.clone())));
            }
            WorkKind::InstantiateProcess {
                process_definition_id,
                start_flow_node,
                message,
                instantiation_token,
            } => {
                params.push(("process_definition_id", Int(*process_definition_id)));
                params.push(("instantiation_token", Str(instantiation_token.to_string())));
                if let Some(start) = start_flow_node {
                    params.push(("start_flow_node", Str(start.clone())));
                }
                if let Some(couple) = message {
                    params.push(("message_instance_id", Int(couple.message_instance_id)));
                    params.push(("waiting_message_id", Int(couple.waiting_message_id)));
                }
            }
            WorkKind::ResumeProcess {
                process_definition_id,
                process_instance_id,
                activation_event,
            } => {
                params.push(("process_definition_id", Int(*process_definition_id)));
                params.push(("process_instance_id", Int(*process_instance_id)));
                params.push(("activation_event", Str(activation_event.to_string())));
            }
        }

        params
    }

    /// Encode for the queue.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WorkError::InvalidDescriptor(e.to_string()))
    }

    /// Decode from the queue.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| WorkError::InvalidDescriptor(e.to_string()))
    }
}

fn push_fingerprint(params: &mut Vec<(&'static str, ParamValue)>, fingerprint: &StateFingerprint) {
    params.push(("state_id", ParamValue::Int(fingerprint.state_id as i64)));
    params.push(("executing", ParamValue::Bool(fingerprint.executing)));
    params.push(("aborting", ParamValue::Bool(fingerprint.aborting)));
    params.push(("canceling", ParamValue::Bool(fingerprint.canceling)));
}

impl fmt::Display for WorkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_tag())?;
        for (index, (name, value)) in self.parameters().iter().enumerate() {
            let separator = if index == 0 { ": " } else { ", " };
            write!(f, "{}{}={}", separator, name, value)?;
        }
        Ok(())
    }
}
