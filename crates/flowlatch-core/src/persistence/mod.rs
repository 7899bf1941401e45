// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces for flowlatch-core.
//!
//! The execution core does not own the engine's runtime tables. It reaches
//! them through the store traits below, which the embedding engine implements
//! on top of its own database. [`crate::memory::InMemoryStore`] implements all
//! of them for tests and embedded use.
//!
//! Every store call names the transaction it runs in. Writes made under a
//! transaction become visible to other transactions only once it commits.
//!
//! The durable work queue and incident log live in [`sqlite`].

pub mod sqlite;

pub use self::sqlite::{SqliteIncidentReporter, SqliteWorkQueue};

use crate::error::Result;
use crate::model::{
    ConnectorEvent, ConnectorFailure, ConnectorInstance, ConnectorState, ContainerRef,
    FlowNodeInstance, MessageInstance, ProcessInstance, ProcessState, ProgressKey, WaitingEvent,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;
use uuid::Uuid;

/// Access to flow node instances.
#[async_trait]
pub trait FlowNodeStore: Send + Sync {
    /// Load a flow node instance.
    async fn get_flow_node(&self, tx: TransactionId, id: i64) -> Result<Option<FlowNodeInstance>>;

    /// Move a flow node to a new state. Clears the executing flag.
    async fn set_flow_node_state(
        &self,
        tx: TransactionId,
        id: i64,
        state_id: i32,
        terminal: bool,
    ) -> Result<()>;

    /// Set or clear the executing flag of the current state.
    async fn set_executing(&self, tx: TransactionId, id: i64, executing: bool) -> Result<()>;

    /// Ids of flow nodes a restart must look at, ascending and greater than
    /// `after_id`: every node not yet archived, i.e. non-terminal nodes and
    /// terminal nodes whose parent was not yet notified.
    async fn list_flow_nodes_to_restart(
        &self,
        tx: TransactionId,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>>;
}

/// Access to process instances.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Load a process instance.
    async fn get_process(&self, tx: TransactionId, id: i64) -> Result<Option<ProcessInstance>>;

    /// Archive the current state, then move the process to `state`.
    async fn set_process_state(&self, tx: TransactionId, id: i64, state: ProcessState)
    -> Result<()>;

    /// Ids of processes in any of `states`, ascending and greater than `after_id`.
    async fn list_processes_in_states(
        &self,
        tx: TransactionId,
        states: &[ProcessState],
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>>;

    /// Process instance started under an instantiation token, if any.
    async fn find_instantiation(&self, tx: TransactionId, token: Uuid) -> Result<Option<i64>>;

    /// Remember that `token` started `process_instance_id`. A token is
    /// recorded at most once; the commit of a second record must fail.
    async fn record_instantiation(
        &self,
        tx: TransactionId,
        token: Uuid,
        process_instance_id: i64,
    ) -> Result<()>;
}

/// Access to connector instances.
#[async_trait]
pub trait ConnectorStore: Send + Sync {
    /// Load a connector instance.
    async fn get_connector(&self, tx: TransactionId, id: i64) -> Result<Option<ConnectorInstance>>;

    /// Move a connector to a new state.
    async fn set_connector_state(
        &self,
        tx: TransactionId,
        id: i64,
        state: ConnectorState,
    ) -> Result<()>;

    /// Move a connector to FAILED and keep the failure details.
    async fn record_connector_failure(
        &self,
        tx: TransactionId,
        id: i64,
        failure: ConnectorFailure,
    ) -> Result<()>;

    /// First non-terminal connector of a container for an activation event,
    /// by execution order.
    async fn next_pending_connector(
        &self,
        tx: TransactionId,
        container: ContainerRef,
        event: ConnectorEvent,
    ) -> Result<Option<ConnectorInstance>>;
}

/// Access to messages and waiting events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Load a message instance.
    async fn get_message(&self, tx: TransactionId, id: i64) -> Result<Option<MessageInstance>>;

    /// Load a waiting event.
    async fn get_waiting_event(&self, tx: TransactionId, id: i64) -> Result<Option<WaitingEvent>>;

    /// Update a message's reservation state.
    async fn set_message_progress(
        &self,
        tx: TransactionId,
        id: i64,
        progress: ProgressKey,
    ) -> Result<()>;

    /// Update a waiting event's reservation state.
    async fn set_waiting_event_progress(
        &self,
        tx: TransactionId,
        id: i64,
        progress: ProgressKey,
    ) -> Result<()>;

    /// Delete a consumed message.
    async fn delete_message(&self, tx: TransactionId, id: i64) -> Result<()>;

    /// Up to `limit` message ids currently `IN_PROGRESS`.
    async fn list_messages_in_progress(&self, tx: TransactionId, limit: usize) -> Result<Vec<i64>>;

    /// Up to `limit` waiting event ids currently `IN_PROGRESS`.
    async fn list_waiting_events_in_progress(
        &self,
        tx: TransactionId,
        limit: usize,
    ) -> Result<Vec<i64>>;

    /// Remove the waiting events attached to a flow node. Returns how many went.
    async fn delete_waiting_events_of_flow_node(
        &self,
        tx: TransactionId,
        flow_node_instance_id: i64,
    ) -> Result<usize>;
}

/// Identifier of an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Transaction demarcation over the engine's stores.
#[async_trait]
pub trait TransactionRunner: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<TransactionId>;

    /// Commit a transaction.
    async fn commit(&self, tx: TransactionId) -> Result<()>;

    /// Roll a transaction back.
    async fn rollback(&self, tx: TransactionId) -> Result<()>;
}

/// An open transaction.
///
/// Finish it with [`Transaction::finish`] or let [`Transaction::run`] do it.
/// `run` also rolls back when the body panics. A transaction dropped while
/// still open (a cancelled future, a panic outside `run`) is logged and left
/// to the runner.
pub struct Transaction<'a> {
    runner: &'a dyn TransactionRunner,
    id: TransactionId,
    operation: &'static str,
    open: bool,
}

impl<'a> Transaction<'a> {
    /// Open a transaction for the named operation.
    pub async fn begin(runner: &'a dyn TransactionRunner, operation: &'static str) -> Result<Self> {
        let id = runner.begin().await?;
        Ok(Self {
            runner,
            id,
            operation,
            open: true,
        })
    }

    /// Transaction identifier.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Commit when `result` is `Ok`, roll back otherwise.
    ///
    /// A commit failure replaces the successful result. A rollback failure is
    /// logged and the original error is returned.
    pub async fn finish<T: Send>(mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.open = false;
                self.runner.commit(self.id).await?;
                Ok(value)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Await `body` and finish with its result. A panic in `body` rolls the
    /// transaction back before it resumes.
    pub async fn run<T, F>(self, body: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => self.finish(result).await,
            Err(panic) => {
                self.rollback().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Roll back, logging a rollback failure.
    pub async fn rollback(mut self) {
        self.open = false;
        if let Err(rollback_err) = self.runner.rollback(self.id).await {
            warn!(
                transaction = %self.id,
                operation = self.operation,
                error = %rollback_err,
                "Rollback failed"
            );
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.open {
            warn!(
                transaction = %self.id,
                operation = self.operation,
                "Transaction dropped while open"
            );
        }
    }
}
