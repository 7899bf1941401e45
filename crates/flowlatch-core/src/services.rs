// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators the works depend on.
//!
//! [`Services`] is passed explicitly to every work through its
//! [`crate::work::WorkContext`]. It bundles the stores, the lock and session
//! managers, the incident sink, the queue, and the engine hooks that carry
//! the actual process semantics (flow-node execution, connector calls, event
//! delivery, process instantiation).

use crate::config::Config;
use crate::error::Result;
use crate::incident::{IncidentReporter, LoggingIncidentReporter};
use crate::lock::{LocalLockService, LockService, Resubmissions};
use crate::memory::{InMemorySessionManager, InMemoryWorkQueue};
use crate::model::{
    ConnectorEvent, ConnectorInstance, ContainerRef, FlowNodeInstance, MessageInstance,
    ProcessInstance, WaitingEvent,
};
use crate::persistence::{
    ConnectorStore, EventStore, FlowNodeStore, ProcessStore, SqliteIncidentReporter,
    SqliteWorkQueue, TransactionId, TransactionRunner, sqlite,
};
use crate::queue::WorkQueue;
use crate::work::SessionManager;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Evaluated connector inputs.
pub type ConnectorInputs = serde_json::Map<String, serde_json::Value>;

/// Values produced by a connector.
pub type ConnectorOutputs = serde_json::Map<String, serde_json::Value>;

/// Result of throwing an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEventHandling {
    /// A boundary or event sub-process caught the error.
    Caught,
    /// Nothing catches the error code.
    NotCaught,
}

/// Flow-node semantics of the engine.
///
/// Every hook runs inside the transaction `tx` of the calling work and must
/// make its store writes under it.
#[async_trait]
pub trait FlowNodeExecutor: Send + Sync {
    /// Advance the flow node one step while the process instance is locked.
    async fn execute_flow_node(&self, tx: TransactionId, flow_node: &FlowNodeInstance)
    -> Result<()>;

    /// Archive a terminal child and continue its parent.
    async fn child_finished(&self, tx: TransactionId, child: &FlowNodeInstance) -> Result<()>;

    /// Resume the call activity `caller_id` after its called process finished.
    async fn child_process_finished(
        &self,
        tx: TransactionId,
        process: &ProcessInstance,
        caller_id: i64,
    ) -> Result<()>;

    /// Whether a gateway's merge condition is fulfilled.
    async fn is_merge_condition_fulfilled(
        &self,
        tx: TransactionId,
        gateway: &FlowNodeInstance,
    ) -> Result<bool>;

    /// Continue an activity after one of its connectors finished for `event`.
    async fn continue_after_connector(
        &self,
        tx: TransactionId,
        flow_node: &FlowNodeInstance,
        event: ConnectorEvent,
    ) -> Result<()>;
}

/// Process-level semantics of the engine.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    /// Continue a process after one of its connectors finished for `event`:
    /// run the next connector, start the flow, or complete the process.
    async fn continue_after_connectors(
        &self,
        tx: TransactionId,
        process: &ProcessInstance,
        event: ConnectorEvent,
    ) -> Result<()>;

    /// Start a new instance. Returns the new process instance id.
    async fn instantiate(
        &self,
        tx: TransactionId,
        process_definition_id: i64,
        start_flow_node: Option<&str>,
        message: Option<&MessageInstance>,
    ) -> Result<i64>;
}

/// Connector implementations.
#[async_trait]
pub trait ConnectorExecutor: Send + Sync {
    /// Evaluate input expressions.
    async fn evaluate_inputs(
        &self,
        tx: TransactionId,
        connector: &ConnectorInstance,
    ) -> Result<ConnectorInputs>;

    /// Call the connector. Runs outside any transaction.
    async fn execute(
        &self,
        connector: &ConnectorInstance,
        inputs: ConnectorInputs,
    ) -> Result<ConnectorOutputs>;

    /// Write outputs back to the container.
    async fn apply_outputs(
        &self,
        tx: TransactionId,
        connector: &ConnectorInstance,
        outputs: ConnectorOutputs,
    ) -> Result<()>;
}

/// Event delivery.
#[async_trait]
pub trait EventsHandler: Send + Sync {
    /// Throw an error event from a container.
    async fn throw_error_event(
        &self,
        tx: TransactionId,
        container: ContainerRef,
        error_code: &str,
    ) -> Result<ErrorEventHandling>;

    /// Deliver a message to a waiting intermediate or boundary catch event.
    async fn trigger_catch_message(
        &self,
        tx: TransactionId,
        waiting: &WaitingEvent,
        message: &MessageInstance,
    ) -> Result<()>;

    /// Deliver a signal to a waiting intermediate or boundary catch event.
    async fn trigger_signal(&self, tx: TransactionId, waiting: &WaitingEvent) -> Result<()>;
}

/// Everything a work needs, passed explicitly.
pub struct Services {
    /// Work-execution configuration.
    pub config: Config,
    /// Flow node instances.
    pub flow_nodes: Arc<dyn FlowNodeStore>,
    /// Process instances.
    pub processes: Arc<dyn ProcessStore>,
    /// Connector instances.
    pub connectors: Arc<dyn ConnectorStore>,
    /// Messages and waiting events.
    pub events: Arc<dyn EventStore>,
    /// Transaction demarcation.
    pub transactions: Arc<dyn TransactionRunner>,
    /// Process-instance locks.
    pub locks: Arc<dyn LockService>,
    /// Session binding.
    pub sessions: Arc<dyn SessionManager>,
    /// Incident sink.
    pub incidents: Arc<dyn IncidentReporter>,
    /// Work queue.
    pub queue: Arc<dyn WorkQueue>,
    /// Flow-node semantics.
    pub flow_node_executor: Arc<dyn FlowNodeExecutor>,
    /// Process semantics.
    pub process_executor: Arc<dyn ProcessExecutor>,
    /// Connector implementations.
    pub connector_executor: Arc<dyn ConnectorExecutor>,
    /// Event delivery.
    pub events_handler: Arc<dyn EventsHandler>,
    resubmissions: Mutex<Option<Resubmissions>>,
}

impl Services {
    /// Start building a services bundle.
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::default()
    }

    /// Take the channel on which lock-rejected works come back.
    ///
    /// Returns `Some` once; the worker pool owns it afterwards.
    pub fn take_resubmissions(&self) -> Option<Resubmissions> {
        self.resubmissions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .field("stores", &"...")
            .field("engine", &"...")
            .finish()
    }
}

/// Builder for [`Services`].
///
/// Stores and engine hooks are required. Locks, sessions, incidents and the
/// queue default to their in-process implementations.
#[derive(Default)]
pub struct ServicesBuilder {
    config: Option<Config>,
    flow_nodes: Option<Arc<dyn FlowNodeStore>>,
    processes: Option<Arc<dyn ProcessStore>>,
    connectors: Option<Arc<dyn ConnectorStore>>,
    events: Option<Arc<dyn EventStore>>,
    transactions: Option<Arc<dyn TransactionRunner>>,
    locks: Option<(Arc<dyn LockService>, Option<Resubmissions>)>,
    sessions: Option<Arc<dyn SessionManager>>,
    incidents: Option<Arc<dyn IncidentReporter>>,
    queue: Option<Arc<dyn WorkQueue>>,
    flow_node_executor: Option<Arc<dyn FlowNodeExecutor>>,
    process_executor: Option<Arc<dyn ProcessExecutor>>,
    connector_executor: Option<Arc<dyn ConnectorExecutor>>,
    events_handler: Option<Arc<dyn EventsHandler>>,
}

impl ServicesBuilder {
    /// Set the configuration (default: [`Config::default`]).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use one object for every store and for transactions.
    pub fn storage<S>(mut self, store: Arc<S>) -> Self
    where
        S: FlowNodeStore + ProcessStore + ConnectorStore + EventStore + TransactionRunner + 'static,
    {
        self.flow_nodes = Some(store.clone() as Arc<dyn FlowNodeStore>);
        self.processes = Some(store.clone() as Arc<dyn ProcessStore>);
        self.connectors = Some(store.clone() as Arc<dyn ConnectorStore>);
        self.events = Some(store.clone() as Arc<dyn EventStore>);
        self.transactions = Some(store as Arc<dyn TransactionRunner>);
        self
    }

    /// Use one object for every engine hook.
    pub fn engine<E>(mut self, engine: Arc<E>) -> Self
    where
        E: FlowNodeExecutor + ProcessExecutor + ConnectorExecutor + EventsHandler + 'static,
    {
        self.flow_node_executor = Some(engine.clone() as Arc<dyn FlowNodeExecutor>);
        self.process_executor = Some(engine.clone() as Arc<dyn ProcessExecutor>);
        self.connector_executor = Some(engine.clone() as Arc<dyn ConnectorExecutor>);
        self.events_handler = Some(engine as Arc<dyn EventsHandler>);
        self
    }

    /// Set the flow node store.
    pub fn flow_node_store(mut self, store: Arc<dyn FlowNodeStore>) -> Self {
        self.flow_nodes = Some(store);
        self
    }

    /// Set the transaction runner.
    pub fn transaction_runner(mut self, runner: Arc<dyn TransactionRunner>) -> Self {
        self.transactions = Some(runner);
        self
    }

    /// Set the lock service and the channel its rejected works come back on.
    pub fn lock_service(
        mut self,
        locks: Arc<dyn LockService>,
        resubmissions: Option<Resubmissions>,
    ) -> Self {
        self.locks = Some((locks, resubmissions));
        self
    }

    /// Set the session manager.
    pub fn session_manager(mut self, sessions: Arc<dyn SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Set the incident reporter.
    pub fn incident_reporter(mut self, incidents: Arc<dyn IncidentReporter>) -> Self {
        self.incidents = Some(incidents);
        self
    }

    /// Set the work queue.
    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the connector executor.
    pub fn connector_executor(mut self, executor: Arc<dyn ConnectorExecutor>) -> Self {
        self.connector_executor = Some(executor);
        self
    }

    /// Build the services bundle, first opening the SQLite database at
    /// [`Config::database_url`] when one is set. The durable queue and
    /// incident log on it replace the in-process defaults; a queue or
    /// reporter set on the builder is kept.
    pub async fn connect(mut self) -> anyhow::Result<Services> {
        let url = self
            .config
            .as_ref()
            .and_then(|config| config.database_url.clone());
        if let Some(url) = url
            && (self.queue.is_none() || self.incidents.is_none())
        {
            let pool = sqlite::connect_url(&url).await?;
            info!(database = %url, "Durable work queue and incident log opened");
            if self.queue.is_none() {
                self.queue = Some(Arc::new(SqliteWorkQueue::new(pool.clone())));
            }
            if self.incidents.is_none() {
                self.incidents = Some(Arc::new(SqliteIncidentReporter::new(pool)));
            }
        }
        self.build()
    }

    /// Build the services bundle.
    pub fn build(self) -> anyhow::Result<Services> {
        let (locks, resubmissions) = match self.locks {
            Some(locks) => locks,
            None => {
                let (locks, resubmissions) = LocalLockService::new();
                (Arc::new(locks) as Arc<dyn LockService>, Some(resubmissions))
            }
        };

        Ok(Services {
            config: self.config.unwrap_or_default(),
            flow_nodes: self
                .flow_nodes
                .ok_or_else(|| anyhow::anyhow!("flow node store is required"))?,
            processes: self
                .processes
                .ok_or_else(|| anyhow::anyhow!("process store is required"))?,
            connectors: self
                .connectors
                .ok_or_else(|| anyhow::anyhow!("connector store is required"))?,
            events: self
                .events
                .ok_or_else(|| anyhow::anyhow!("event store is required"))?,
            transactions: self
                .transactions
                .ok_or_else(|| anyhow::anyhow!("transaction runner is required"))?,
            locks,
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(InMemorySessionManager::new()) as Arc<dyn SessionManager>),
            incidents: self
                .incidents
                .unwrap_or_else(|| Arc::new(LoggingIncidentReporter) as Arc<dyn IncidentReporter>),
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(InMemoryWorkQueue::new()) as Arc<dyn WorkQueue>),
            flow_node_executor: self
                .flow_node_executor
                .ok_or_else(|| anyhow::anyhow!("flow node executor is required"))?,
            process_executor: self
                .process_executor
                .ok_or_else(|| anyhow::anyhow!("process executor is required"))?,
            connector_executor: self
                .connector_executor
                .ok_or_else(|| anyhow::anyhow!("connector executor is required"))?,
            events_handler: self
                .events_handler
                .ok_or_else(|| anyhow::anyhow!("events handler is required"))?,
            resubmissions: Mutex::new(resubmissions),
        })
    }
}
