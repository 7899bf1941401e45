// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Moving flow nodes to the FAILED state.

use crate::error::Result;
use crate::model::FlowNodeInstance;
use crate::persistence::TransactionId;
use crate::services::Services;
use tracing::{debug, info, instrument, warn};

/// Sets flow nodes to FAILED, idempotently.
///
/// Nodes that are gone, already failed, terminal, or no longer in the state
/// the caller expected are left untouched. Waiting events attached to a node
/// that fails are removed so nothing triggers it afterwards.
pub struct FailedStateSetter<'a> {
    services: &'a Services,
    tx: TransactionId,
}

impl<'a> FailedStateSetter<'a> {
    /// Setter writing under the open transaction `tx`.
    pub fn new(services: &'a Services, tx: TransactionId) -> Self {
        Self { services, tx }
    }

    /// Fail the flow node.
    ///
    /// With `expected_state_id`, the node is only failed if it is still in that
    /// state. Returns whether the node was moved to FAILED.
    #[instrument(skip(self))]
    pub async fn set_as_failed(
        &self,
        flow_node_instance_id: i64,
        expected_state_id: Option<i32>,
    ) -> Result<bool> {
        let Some(flow_node) = self
            .services
            .flow_nodes
            .get_flow_node(self.tx, flow_node_instance_id)
            .await?
        else {
            info!("Flow node not found, nothing to set as failed");
            return Ok(false);
        };

        if flow_node.is_failed() {
            debug!("Flow node already failed");
            return Ok(false);
        }

        if flow_node.terminal {
            info!(state_id = flow_node.state_id, "Flow node already in a terminal state, not failing it");
            return Ok(false);
        }

        if let Some(expected) = expected_state_id
            && flow_node.state_id != expected
        {
            info!(
                expected_state_id = expected,
                state_id = flow_node.state_id,
                "Flow node moved to another state since the failure, not failing it"
            );
            return Ok(false);
        }

        let interrupted = self
            .services
            .events
            .delete_waiting_events_of_flow_node(self.tx, flow_node_instance_id)
            .await?;

        self.services
            .flow_nodes
            .set_flow_node_state(
                self.tx,
                flow_node_instance_id,
                FlowNodeInstance::FAILED_STATE_ID,
                false,
            )
            .await?;

        warn!(
            previous_state_id = flow_node.state_id,
            interrupted_waiting_events = interrupted,
            "Flow node set to failed"
        );
        Ok(true)
    }
}
