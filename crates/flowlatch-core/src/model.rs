// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime entities the work pipeline reads and mutates.
//!
//! These are the records exchanged with the store traits in
//! [`crate::persistence`]. They carry only what the execution core needs;
//! definitions, variables and archives belong to the surrounding engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Flow nodes
// ============================================================================

/// Kind of a flow node, used to pick its restart eligibility rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeKind {
    /// Automatic or human task.
    Activity,
    /// Activity that starts a child process.
    CallActivity,
    /// Embedded sub-process.
    SubProcess,
    /// Merging or splitting gateway.
    Gateway,
    /// Start, intermediate, boundary or end event.
    Event,
}

/// A running flow node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    /// Flow node instance id.
    pub id: i64,
    /// Name of the flow node in its definition.
    pub name: String,
    /// Kind of flow node.
    pub kind: FlowNodeKind,
    /// Definition of the process the node belongs to.
    pub process_definition_id: i64,
    /// Process instance that directly contains this node.
    pub parent_process_instance_id: i64,
    /// Top-level process instance.
    pub root_process_instance_id: i64,
    /// Numeric state identifier.
    pub state_id: i32,
    /// Whether the current state is still running its body.
    pub state_executing: bool,
    /// Whether the node is being aborted.
    pub aborting: bool,
    /// Whether the node is being cancelled.
    pub canceling: bool,
    /// Whether the current state is terminal.
    pub terminal: bool,
}

impl FlowNodeInstance {
    /// State identifier of the FAILED state.
    pub const FAILED_STATE_ID: i32 = 3;

    /// Whether the node is in the FAILED state.
    pub fn is_failed(&self) -> bool {
        self.state_id == Self::FAILED_STATE_ID
    }
}

// ============================================================================
// Process instances
// ============================================================================

/// Lifecycle state of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Created, on-enter connectors not yet finished.
    Initializing,
    /// Running its flow.
    Started,
    /// Flow finished, on-finish connectors not yet finished.
    Completing,
    /// Finished normally.
    Completed,
    /// Abort requested.
    Aborting,
    /// Aborted.
    Aborted,
    /// Cancellation requested.
    Cancelling,
    /// Cancelled.
    Cancelled,
    /// Failed and waiting for an operator.
    Error,
}

impl ProcessState {
    /// Numeric state identifier stored alongside the instance.
    pub fn id(&self) -> i32 {
        match self {
            ProcessState::Initializing => 0,
            ProcessState::Started => 1,
            ProcessState::Cancelled => 3,
            ProcessState::Aborted => 4,
            ProcessState::Completed => 6,
            ProcessState::Error => 7,
            ProcessState::Completing => 10,
            ProcessState::Aborting => 11,
            ProcessState::Cancelling => 12,
        }
    }

    /// Parse a numeric state identifier.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(ProcessState::Initializing),
            1 => Some(ProcessState::Started),
            3 => Some(ProcessState::Cancelled),
            4 => Some(ProcessState::Aborted),
            6 => Some(ProcessState::Completed),
            7 => Some(ProcessState::Error),
            10 => Some(ProcessState::Completing),
            11 => Some(ProcessState::Aborting),
            12 => Some(ProcessState::Cancelling),
            _ => None,
        }
    }

    /// Completed, aborted or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Aborted | ProcessState::Cancelled
        )
    }

    /// Connector activation event a process waits on in this state, if any.
    pub fn pending_connector_event(&self) -> Option<ConnectorEvent> {
        match self {
            ProcessState::Initializing => Some(ConnectorEvent::OnEnter),
            ProcessState::Completing => Some(ConnectorEvent::OnFinish),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Initializing => "INITIALIZING",
            ProcessState::Started => "STARTED",
            ProcessState::Completing => "COMPLETING",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Aborting => "ABORTING",
            ProcessState::Aborted => "ABORTED",
            ProcessState::Cancelling => "CANCELLING",
            ProcessState::Cancelled => "CANCELLED",
            ProcessState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A running process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Process instance id.
    pub id: i64,
    /// Definition this instance runs.
    pub process_definition_id: i64,
    /// Top-level process instance (itself for root processes).
    pub root_process_instance_id: i64,
    /// Current lifecycle state.
    pub state: ProcessState,
    /// Call-activity flow node that started this process.
    pub caller_id: Option<i64>,
    /// Event that interrupted the process, if any.
    pub interrupting_event_id: Option<i64>,
}

/// Snapshot written before every process state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedProcessState {
    /// Process instance id.
    pub process_instance_id: i64,
    /// State the process had when it was archived.
    pub state: ProcessState,
    /// When the snapshot was taken.
    pub archived_at: DateTime<Utc>,
}

// ============================================================================
// Connectors
// ============================================================================

/// When a connector runs relative to its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorEvent {
    /// Before the container's body.
    OnEnter,
    /// After the container's body.
    OnFinish,
}

impl fmt::Display for ConnectorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorEvent::OnEnter => f.write_str("ON_ENTER"),
            ConnectorEvent::OnFinish => f.write_str("ON_FINISH"),
        }
    }
}

/// Connector instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorState {
    /// Not started.
    Created,
    /// Inputs evaluated, call in progress.
    Executing,
    /// Outputs applied.
    Done,
    /// Failed; see the recorded failure.
    Failed,
    /// Skipped by the engine.
    Skipped,
}

impl ConnectorState {
    /// Done, failed or skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectorState::Done | ConnectorState::Failed | ConnectorState::Skipped
        )
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorState::Created => "CREATED",
            ConnectorState::Executing => "EXECUTING",
            ConnectorState::Done => "DONE",
            ConnectorState::Failed => "FAILED",
            ConnectorState::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Policy applied when a connector fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailAction {
    /// Fail the connector and its container.
    Fail,
    /// Fail the connector and let the container continue.
    Ignore,
    /// Throw the connector's error code as an error event.
    ErrorEvent,
}

/// Phase of connector execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorPhase {
    /// Evaluating input expressions.
    EvaluateInputs,
    /// Running the connector implementation.
    Execute,
    /// Writing outputs back to the container.
    ApplyOutputs,
}

impl fmt::Display for ConnectorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorPhase::EvaluateInputs => f.write_str("evaluating inputs"),
            ConnectorPhase::Execute => f.write_str("executing"),
            ConnectorPhase::ApplyOutputs => f.write_str("applying outputs"),
        }
    }
}

/// Entity a connector is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ContainerRef {
    /// A flow node instance.
    Activity(i64),
    /// A process instance.
    Process(i64),
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerRef::Activity(id) => write!(f, "flow node {}", id),
            ContainerRef::Process(id) => write!(f, "process {}", id),
        }
    }
}

/// Failure details persisted with a failed connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorFailure {
    /// Phase in which the connector failed, when known.
    pub phase: Option<ConnectorPhase>,
    /// Failure message.
    pub message: String,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// A connector attached to an activity or a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInstance {
    /// Connector instance id.
    pub id: i64,
    /// Connector definition name.
    pub name: String,
    /// Activity or process the connector belongs to.
    pub container: ContainerRef,
    /// When the connector runs.
    pub activation_event: ConnectorEvent,
    /// Current state.
    pub state: ConnectorState,
    /// What to do when it fails.
    pub fail_action: FailAction,
    /// Error code thrown for [`FailAction::ErrorEvent`].
    pub error_code: Option<String>,
    /// Position among the connectors of the same container and event.
    pub execution_order: i32,
    /// Failure recorded when the connector moved to FAILED.
    pub failure: Option<ConnectorFailure>,
}

// ============================================================================
// Messages, signals and waiting events
// ============================================================================

/// Reservation state shared by message instances and waiting events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKey {
    /// Available for matching.
    Free,
    /// Reserved by a registered couple work.
    InProgress,
    /// Consumed by a non-reusable catch event.
    Handled,
}

/// A message sent to the engine and not yet consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInstance {
    /// Message instance id.
    pub id: i64,
    /// Message name.
    pub message_name: String,
    /// Target process name, if addressed.
    pub target_process: Option<String>,
    /// Target flow node name, if addressed.
    pub target_flow_node: Option<String>,
    /// Reservation state.
    pub progress: ProgressKey,
    /// Message payload.
    pub payload: serde_json::Value,
}

/// What a waiting event listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingEventKind {
    /// Message start event of a process definition.
    MessageStart,
    /// Intermediate or boundary message catch event.
    MessageCatch,
    /// Signal start event of a process definition.
    SignalStart,
    /// Intermediate or boundary signal catch event.
    SignalCatch,
}

impl WaitingEventKind {
    /// Start events instantiate a new process and stay reusable.
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            WaitingEventKind::MessageStart | WaitingEventKind::SignalStart
        )
    }
}

/// A catch event waiting for a message or a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingEvent {
    /// Waiting event id.
    pub id: i64,
    /// What the event listens for.
    pub kind: WaitingEventKind,
    /// Message or signal name.
    pub event_name: String,
    /// Definition of the process the event belongs to.
    pub process_definition_id: i64,
    /// Running process, for catch events.
    pub process_instance_id: Option<i64>,
    /// Waiting flow node, for catch events.
    pub flow_node_instance_id: Option<i64>,
    /// Name of the catching flow node.
    pub flow_node_name: String,
    /// Reservation state.
    pub progress: ProgressKey,
}
