// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowlatch-core.
//!
//! Every fallible operation in the work pipeline returns [`WorkError`]. The
//! failure-handling decorator inspects [`WorkError::is_retryable`] to decide
//! between asking the queue for a redelivery and running compensation.

use crate::model::ConnectorPhase;
use thiserror::Error;

/// Result type using WorkError
pub type Result<T> = std::result::Result<T, WorkError>;

/// Errors raised while executing units of work.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum WorkError {
    /// The process-instance lock could not be acquired within the bounded wait.
    #[error("Unable to lock {resource} within {timeout_ms}ms")]
    LockTimeout {
        /// Rendered lock key.
        resource: String,
        /// How long the caller waited.
        timeout_ms: u64,
    },

    /// An entity the work relies on does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind, e.g. "flow node".
        entity: &'static str,
        /// Identifier that was looked up.
        id: i64,
    },

    /// A store operation failed.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Begin, commit or rollback failed.
    #[error("Transaction error during '{operation}': {details}")]
    Transaction {
        /// The transactional operation.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A connector failed in one of its execution phases.
    #[error("Connector failed while {phase}: {message}")]
    Connector {
        /// Phase in which the connector failed.
        phase: ConnectorPhase,
        /// Failure message.
        message: String,
    },

    /// The work queue rejected an operation.
    #[error("Work queue error: {0}")]
    Queue(String),

    /// A session could not be bound or unbound.
    #[error("Session error: {0}")]
    Session(String),

    /// The work body panicked.
    #[error("Work panicked: {0}")]
    Panicked(String),

    /// A work descriptor could not be decoded or materialized.
    #[error("Invalid work descriptor: {0}")]
    InvalidDescriptor(String),

    /// Any other failure reported by an engine collaborator.
    #[error("{0}")]
    Other(String),
}

impl WorkError {
    /// Shorthand for a [`WorkError::NotFound`].
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Shorthand for a [`WorkError::Storage`].
    pub fn storage(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Shorthand for a [`WorkError::Transaction`].
    pub fn transaction(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Transaction {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Wraps any error as a connector failure in the given phase.
    ///
    /// Errors that already are connector failures keep their original phase.
    pub fn connector(phase: ConnectorPhase, error: impl Into<WorkError>) -> Self {
        match error.into() {
            err @ Self::Connector { .. } => err,
            other => Self::Connector {
                phase,
                message: other.to_string(),
            },
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Transaction { .. } => "TRANSACTION_ERROR",
            Self::Connector { .. } => "CONNECTOR_FAILED",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Session(_) => "SESSION_ERROR",
            Self::Panicked(_) => "PANICKED",
            Self::InvalidDescriptor(_) => "INVALID_DESCRIPTOR",
            Self::Other(_) => "OTHER",
        }
    }

    /// Whether redelivering the same descriptor later may succeed without
    /// compensating first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Queue(_))
    }
}

impl From<sqlx::Error> for WorkError {
    fn from(err: sqlx::Error) -> Self {
        WorkError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for WorkError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        WorkError::Storage {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for WorkError {
    fn from(err: serde_json::Error) -> Self {
        WorkError::Storage {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
