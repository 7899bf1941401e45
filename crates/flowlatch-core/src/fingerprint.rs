// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow-node state fingerprints.
//!
//! A work descriptor captures the state its flow node had when the work was
//! registered. Before touching the node, the work compares that fingerprint
//! with the live node: any difference means the work is stale (it was already
//! executed, or the node moved on) and the work ends without side effects.

use crate::error::{Result, WorkError};
use crate::model::FlowNodeInstance;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of the state fields that identify a flow node's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateFingerprint {
    /// Numeric state identifier.
    pub state_id: i32,
    /// Whether the state body was still running.
    pub executing: bool,
    /// Whether an abort was in progress.
    pub aborting: bool,
    /// Whether a cancellation was in progress.
    pub canceling: bool,
}

impl StateFingerprint {
    /// Fingerprint of a node in a stable (not executing, not interrupted) state.
    pub fn stable(state_id: i32) -> Self {
        Self {
            state_id,
            executing: false,
            aborting: false,
            canceling: false,
        }
    }

    /// Fingerprint of the given node as it is now.
    pub fn of(flow_node: &FlowNodeInstance) -> Self {
        Self {
            state_id: flow_node.state_id,
            executing: flow_node.state_executing,
            aborting: flow_node.aborting,
            canceling: flow_node.canceling,
        }
    }

    /// Whether the live node still carries this fingerprint.
    pub fn matches(&self, flow_node: &FlowNodeInstance) -> bool {
        *self == Self::of(flow_node)
    }
}

impl fmt::Display for StateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stateId={}, executing={}, aborting={}, canceling={}",
            self.state_id, self.executing, self.aborting, self.canceling
        )
    }
}

/// Outcome of a precondition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The node is in the expected state; proceed with it.
    Met(FlowNodeInstance),
    /// The work is stale; carries the diagnostic.
    NotMet(String),
}

/// Checks that a flow node may be executed by a work registered with `expected`.
///
/// A missing node is an error: the work was registered for a node that must
/// exist until it is executed.
pub fn check_execute(
    flow_node_instance_id: i64,
    expected: &StateFingerprint,
    flow_node: Option<FlowNodeInstance>,
) -> Result<Precondition> {
    let flow_node = flow_node.ok_or_else(|| WorkError::not_found("flow node", flow_node_instance_id))?;

    if !expected.matches(&flow_node) {
        return Ok(Precondition::NotMet(format!(
            "Unable to execute flow node {} because it is not in the expected state ({}) but in ({}). \
             Someone probably already called execute on it.",
            flow_node_instance_id,
            expected,
            StateFingerprint::of(&flow_node)
        )));
    }

    Ok(Precondition::Met(flow_node))
}

/// Checks that a finished child may be reported to its parent.
///
/// A missing child means the parent was already notified and the child
/// archived, so it is a precondition failure rather than an error.
pub fn check_child_finished(
    flow_node_instance_id: i64,
    expected: &StateFingerprint,
    flow_node: Option<FlowNodeInstance>,
) -> Precondition {
    let Some(flow_node) = flow_node else {
        return Precondition::NotMet(format!(
            "Flow node {} not found, its parent was probably already notified",
            flow_node_instance_id
        ));
    };

    if !expected.matches(&flow_node) {
        return Precondition::NotMet(format!(
            "Unable to notify the parent of flow node {} because it is not in the expected state ({}) but in ({})",
            flow_node_instance_id,
            expected,
            StateFingerprint::of(&flow_node)
        ));
    }

    if !flow_node.terminal {
        return Precondition::NotMet(format!(
            "Flow node {} is not in a terminal state yet",
            flow_node_instance_id
        ));
    }

    Precondition::Met(flow_node)
}
