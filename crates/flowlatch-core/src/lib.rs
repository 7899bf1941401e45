// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowlatch Core - Asynchronous Work Execution
//!
//! This crate executes the asynchronous units of work of a process engine:
//! executing flow nodes, notifying parents of finished children, running
//! connectors, delivering messages and signals, and starting or resuming
//! process instances. The process semantics themselves stay in the engine,
//! which plugs in through the traits of [`services`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Embedding engine                          │
//! │   (flow-node semantics, connectors, event delivery, stores)   │
//! └───────────────────────────────────────────────────────────────┘
//!            │ submit(WorkDescriptor)               ▲ engine hooks
//!            ▼                                      │
//! ┌─────────────────────┐    ┌──────────────────────┴────────────┐
//! │     Work queue      │───►│            Worker pool            │
//! │ (in-memory/SQLite)  │    │  WorkFactory → decorated works    │
//! └─────────────────────┘    └───────────────────────────────────┘
//!            ▲                                      │
//!            │ resubmit on release                  ▼
//! ┌─────────────────────┐    ┌───────────────────────────────────┐
//! │    Lock service     │◄───│  failure · session · lock ·       │
//! │ (process instances) │    │  transaction · context · work     │
//! └─────────────────────┘    └───────────────────────────────────┘
//! ```
//!
//! # Work kinds
//!
//! | Descriptor | Purpose |
//! |------------|---------|
//! | `EXECUTE_FLOWNODE` | Advance a flow node one step |
//! | `NOTIFY_CHILD_FINISHED` | Continue a parent after a child node or called process finished |
//! | `EXECUTE_CONNECTOR_OF_ACTIVITY` | Run a connector attached to an activity |
//! | `EXECUTE_CONNECTOR_OF_PROCESS` | Run a connector attached to a process |
//! | `EXECUTE_MESSAGE_COUPLE` | Deliver a matched message |
//! | `TRIGGER_SIGNAL` | Deliver a signal |
//! | `INSTANTIATE_PROCESS` | Start a process instance |
//! | `RESUME_PROCESS` | Continue a process after its connectors |
//!
//! # Guarantees
//!
//! - Works touching a process instance hold its lock, so at most one of them
//!   mutates the instance at a time.
//! - Every work re-checks the live state before acting. Redelivered or
//!   re-registered works end as skipped without side effects.
//! - Failures are compensated by the work itself. When compensation fails,
//!   an incident is raised for an operator.
//! - At startup, [`restart`] rebuilds the pending works from the stores.

#![deny(missing_docs)]

/// Work-execution configuration loaded from environment variables.
pub mod config;

/// Serializable work descriptors.
pub mod descriptor;

/// Error types for work execution.
pub mod error;

/// Concrete works.
pub mod execution;

/// Descriptor to decorated-work materialization.
pub mod factory;

/// Flow-node state fingerprints and precondition checks.
pub mod fingerprint;

/// Incidents and their reporters.
pub mod incident;

/// Process-instance locks.
pub mod lock;

/// In-process implementations of the stores, queue, sessions and incident sink.
pub mod memory;

/// Runtime entities the works operate on.
pub mod model;

/// Store traits, transactions, and the SQLite queue.
pub mod persistence;

/// Work queue abstraction.
pub mod queue;

/// Crash recovery at startup.
pub mod restart;

/// Embeddable runtime.
pub mod runtime;

/// Collaborators passed to every work.
pub mod services;

/// The unit-of-work abstraction and its decorators.
pub mod work;

/// Worker pool.
pub mod worker;

pub use config::Config;
pub use descriptor::{WorkDescriptor, WorkKind};
pub use error::{Result, WorkError};
pub use runtime::WorkRuntime;
pub use services::Services;
pub use work::Outcome;
