// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery at startup.
//!
//! After a crash the queue may have lost works and the stores may hold
//! reservations nobody will finish. Before workers start, the restart
//! handlers rebuild the set of pending works from the persistent state:
//!
//! 1. [`MessageResetHandler`] releases messages and waiting events stuck in
//!    `IN_PROGRESS`, so they can be matched again.
//! 2. [`FlowNodeRestartHandler`] re-registers a work for every flow node that
//!    was not yet archived.
//! 3. [`ProcessRestartHandler`] re-drives processes stuck in their connector
//!    phases and notifies callers of finished called processes.
//!
//! Each handler discovers its entities first and then re-registers them in
//! batches, one transaction per batch. Re-registered works may duplicate
//! works still in a durable queue; their state preconditions make the
//! duplicates no-ops, so running the restart twice converges to the same
//! state.

mod flow_nodes;
mod messages;
mod processes;

pub use flow_nodes::FlowNodeRestartHandler;
pub use messages::MessageResetHandler;
pub use processes::ProcessRestartHandler;

use crate::error::Result;
use crate::services::Services;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument};

/// What a restart did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartReport {
    /// Messages put back to `FREE`.
    pub reset_messages: usize,
    /// Waiting events put back to `FREE`.
    pub reset_waiting_events: usize,
    /// Terminal flow nodes whose parent gets notified again.
    pub flow_nodes_notified: usize,
    /// Flow nodes re-registered for execution.
    pub flow_nodes_restarted: usize,
    /// Flow nodes left alone because they cannot continue yet.
    pub flow_nodes_not_eligible: usize,
    /// Processes re-driven through their connector phase.
    pub processes_redriven: usize,
    /// Callers notified of a finished called process.
    pub callers_notified: usize,
}

impl RestartReport {
    /// Number of works registered.
    pub fn works_registered(&self) -> usize {
        self.flow_nodes_notified
            + self.flow_nodes_restarted
            + self.processes_redriven
            + self.callers_notified
    }
}

/// One step of the restart sequence.
#[async_trait]
pub trait RestartHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Discover the entities to recover, then re-register their works.
    async fn handle_restart(&self, services: &Services, report: &mut RestartReport) -> Result<()>;
}

/// Runs restart handlers in order.
pub struct RestartService {
    handlers: Vec<Box<dyn RestartHandler>>,
}

impl RestartService {
    /// The standard sequence: reset reservations, then flow nodes, then
    /// processes.
    pub fn new(batch_size: usize) -> Self {
        Self::with_handlers(vec![
            Box::new(MessageResetHandler::new(batch_size)),
            Box::new(FlowNodeRestartHandler::new(batch_size)),
            Box::new(ProcessRestartHandler::new(batch_size)),
        ])
    }

    /// A custom sequence.
    pub fn with_handlers(handlers: Vec<Box<dyn RestartHandler>>) -> Self {
        Self { handlers }
    }

    /// Run every handler. Stops at the first failing handler, since later
    /// handlers rely on the earlier ones having completed.
    #[instrument(skip_all)]
    pub async fn run(&self, services: &Services) -> Result<RestartReport> {
        let mut report = RestartReport::default();
        for handler in &self.handlers {
            info!(handler = handler.name(), "Running restart handler");
            handler.handle_restart(services, &mut report).await?;
        }
        info!(
            reset_messages = report.reset_messages,
            reset_waiting_events = report.reset_waiting_events,
            flow_nodes_notified = report.flow_nodes_notified,
            flow_nodes_restarted = report.flow_nodes_restarted,
            flow_nodes_not_eligible = report.flow_nodes_not_eligible,
            processes_redriven = report.processes_redriven,
            callers_notified = report.callers_notified,
            "Restart completed"
        );
        Ok(report)
    }
}
