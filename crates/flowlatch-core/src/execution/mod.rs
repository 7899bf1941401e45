// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concrete works.
//!
//! Each work checks its precondition against the live state first and ends
//! as [`crate::work::Outcome::Skipped`] when it no longer applies, which is
//! what makes redelivery and restart re-registration safe.

mod connector;
mod failed_state;
mod flow_node;
mod message;
mod process;
mod signal;

pub use connector::{
    ConnectorTarget, DEFAULT_CONNECTOR_ERROR_CODE, ExecuteConnectorWork, FailActionResolution,
};
pub use failed_state::FailedStateSetter;
pub use flow_node::{ExecuteFlowNodeWork, NotifyChildFinishedWork};
pub use message::ExecuteMessageCoupleWork;
pub use process::{InstantiateProcessWork, ResumeProcessWork};
pub use signal::TriggerSignalWork;
