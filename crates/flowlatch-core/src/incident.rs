// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Incidents: failures nobody could handle automatically.
//!
//! An incident is raised when a work failed and its failure handler failed as
//! well. It carries enough context for an operator to repair the situation by
//! hand, including a recovery procedure phrased by the work itself.
//!
//! Reporting is infallible by signature: a reporter that cannot persist an
//! incident must still log it.

use crate::error::WorkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// A failure requiring operator attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// What was being executed.
    pub description: String,
    /// How an operator can recover.
    pub recovery_procedure: String,
    /// The original failure.
    pub cause: String,
    /// The failure raised while handling the original one.
    pub handling_error: Option<String>,
    /// Tenant the work ran for.
    pub tenant_id: Option<i64>,
    /// Diagnostic annotations collected along the decorator chain.
    pub context: BTreeMap<String, String>,
    /// When the incident was raised.
    pub created_at: DateTime<Utc>,
}

impl Incident {
    /// New incident for a failed work.
    pub fn new(
        description: impl Into<String>,
        recovery_procedure: impl Into<String>,
        cause: &WorkError,
    ) -> Self {
        Self {
            description: description.into(),
            recovery_procedure: recovery_procedure.into(),
            cause: cause.to_string(),
            handling_error: None,
            tenant_id: None,
            context: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach the failure of the failure handler.
    pub fn with_handling_error(mut self, error: &WorkError) -> Self {
        self.handling_error = Some(error.to_string());
        self
    }

    /// Attach the tenant.
    pub fn with_tenant(mut self, tenant_id: Option<i64>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Attach diagnostic context.
    pub fn with_context(mut self, context: &BTreeMap<&'static str, String>) -> Self {
        self.context = context
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self
    }
}

/// Sink for incidents.
#[async_trait]
pub trait IncidentReporter: Send + Sync {
    /// Record an incident. Must not fail.
    async fn report(&self, incident: &Incident);
}

/// Reports incidents to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingIncidentReporter;

#[async_trait]
impl IncidentReporter for LoggingIncidentReporter {
    async fn report(&self, incident: &Incident) {
        error!(
            description = %incident.description,
            cause = %incident.cause,
            handling_error = incident.handling_error.as_deref().unwrap_or("-"),
            tenant_id = ?incident.tenant_id,
            context = ?incident.context,
            recovery = %incident.recovery_procedure,
            "Incident"
        );
    }
}
