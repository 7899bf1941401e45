// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Diagnostic annotations.

use super::{BoxedWork, Outcome, Work, WorkContext};
use crate::error::{Result, WorkError};
use async_trait::async_trait;
use tracing::{Instrument, debug_span};

/// Annotation keys used across the crate.
pub mod keys {
    /// Process definition id.
    pub const PROCESS_DEFINITION_ID: &str = "process_definition_id";
    /// Process instance id.
    pub const PROCESS_INSTANCE_ID: &str = "process_instance_id";
    /// Root process instance id.
    pub const ROOT_PROCESS_INSTANCE_ID: &str = "root_process_instance_id";
    /// Flow node instance id.
    pub const FLOW_NODE_INSTANCE_ID: &str = "flow_node_instance_id";
    /// Connector instance id.
    pub const CONNECTOR_INSTANCE_ID: &str = "connector_instance_id";
    /// Connector definition name.
    pub const CONNECTOR_DEFINITION_NAME: &str = "connector_definition_name";
    /// Connector activation event.
    pub const CONNECTOR_ACTIVATION_EVENT: &str = "connector_activation_event";
    /// Message instance id.
    pub const MESSAGE_INSTANCE_ID: &str = "message_instance_id";
    /// Waiting event id.
    pub const WAITING_EVENT_ID: &str = "waiting_event_id";
    /// Token of a process instantiation.
    pub const INSTANTIATION_TOKEN: &str = "instantiation_token";
}

/// Attaches identifiers to the context and to a tracing span.
pub struct ContextWork {
    inner: BoxedWork,
    entries: Vec<(&'static str, String)>,
}

impl ContextWork {
    /// Wrap `inner`, annotating with `entries`.
    pub fn new(inner: BoxedWork, entries: Vec<(&'static str, String)>) -> Self {
        Self { inner, entries }
    }

    fn apply(&self, ctx: &mut WorkContext) {
        for (key, value) in &self.entries {
            ctx.annotate(*key, value);
        }
    }

    fn rendered(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Work for ContextWork {
    async fn execute(&self, ctx: &mut WorkContext) -> Result<Outcome> {
        self.apply(ctx);
        let span = debug_span!("work_context", context = %self.rendered());
        self.inner.execute(ctx).instrument(span).await
    }

    async fn handle_failure(&self, error: &WorkError, ctx: &mut WorkContext) -> Result<()> {
        self.apply(ctx);
        let span = debug_span!("work_context", context = %self.rendered());
        self.inner.handle_failure(error, ctx).instrument(span).await
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn recovery_procedure(&self) -> String {
        self.inner.recovery_procedure()
    }
}
