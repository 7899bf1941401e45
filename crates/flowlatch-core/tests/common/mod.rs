// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowlatch-core integration tests.
//!
//! Provides a recording engine over the in-memory store and a [`Harness`]
//! wiring it into a services bundle.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use flowlatch_core::config::Config;
use flowlatch_core::descriptor::WorkDescriptor;
use flowlatch_core::error::{Result, WorkError};
use flowlatch_core::factory::WorkFactory;
use flowlatch_core::lock::LocalLockService;
use flowlatch_core::memory::{
    InMemorySessionManager, InMemoryStore, InMemoryWorkQueue, RecordingIncidentReporter,
};
use flowlatch_core::model::{
    ConnectorEvent, ConnectorInstance, ConnectorState, ContainerRef, FailAction, FlowNodeInstance,
    FlowNodeKind, MessageInstance, ProcessInstance, ProcessState, ProgressKey, WaitingEvent,
    WaitingEventKind,
};
use flowlatch_core::persistence::{FlowNodeStore, ProcessStore, TransactionId};
use flowlatch_core::services::{
    ConnectorExecutor, ConnectorInputs, ConnectorOutputs, ErrorEventHandling, EventsHandler,
    FlowNodeExecutor, ProcessExecutor, Services,
};
use flowlatch_core::work::{Outcome, WorkContext};

/// A call made by the core into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ExecuteFlowNode(i64),
    ChildFinished(i64),
    ChildProcessFinished { process: i64, caller: i64 },
    MergeCheck(i64),
    ContinueAfterConnector(i64, ConnectorEvent),
    ContinueProcess(i64, ConnectorEvent),
    Instantiate {
        process_definition_id: i64,
        start_flow_node: Option<String>,
        message: Option<i64>,
    },
    EvaluateInputs(i64),
    ExecuteConnector(i64),
    ApplyOutputs(i64),
    ThrowErrorEvent(ContainerRef, String),
    CatchMessage { waiting: i64, message: i64 },
    Signal(i64),
}

/// Knobs for making engine hooks misbehave.
#[derive(Debug, Default)]
pub struct Behavior {
    pub fail_execute: HashSet<i64>,
    pub panic_execute: HashSet<i64>,
    pub execute_delay: Option<Duration>,
    pub merge_not_fulfilled: HashSet<i64>,
    pub fail_connector: bool,
    pub panic_apply_outputs: bool,
    pub connector_delay: Option<Duration>,
    pub fail_continue_after_connector: bool,
    pub error_event: Option<ErrorEventHandling>,
    pub fail_error_event: bool,
    pub fail_catch_message: bool,
}

/// Engine that records every hook call and applies minimal state changes
/// to the in-memory store.
pub struct RecordingEngine {
    store: Arc<InMemoryStore>,
    calls: Mutex<Vec<Call>>,
    behavior: Mutex<Behavior>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    next_process: AtomicI64,
}

impl RecordingEngine {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(Vec::new()),
            behavior: Mutex::new(Behavior::default()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            next_process: AtomicI64::new(1000),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn behave(&self, configure: impl FnOnce(&mut Behavior)) {
        configure(&mut self.behavior.lock().unwrap());
    }

    /// Highest number of flow-node executions seen running at once.
    pub fn max_concurrent_executions(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl FlowNodeExecutor for RecordingEngine {
    async fn execute_flow_node(&self, tx: TransactionId, flow_node: &FlowNodeInstance) -> Result<()> {
        self.record(Call::ExecuteFlowNode(flow_node.id));
        let (fail, panic, delay) = {
            let behavior = self.behavior.lock().unwrap();
            (
                behavior.fail_execute.contains(&flow_node.id),
                behavior.panic_execute.contains(&flow_node.id),
                behavior.execute_delay,
            )
        };

        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        // Written before failing so a rollback has something to undo.
        self.store
            .set_flow_node_state(tx, flow_node.id, flow_node.state_id + 1, false)
            .await?;
        if panic {
            panic!("flow node {} exploded", flow_node.id);
        }
        if fail {
            return Err(WorkError::Other(format!("flow node {} failed", flow_node.id)));
        }
        Ok(())
    }

    async fn child_finished(&self, tx: TransactionId, child: &FlowNodeInstance) -> Result<()> {
        self.record(Call::ChildFinished(child.id));
        self.store.archive_flow_node(tx, child.id)?;
        Ok(())
    }

    async fn child_process_finished(
        &self,
        tx: TransactionId,
        process: &ProcessInstance,
        caller_id: i64,
    ) -> Result<()> {
        self.record(Call::ChildProcessFinished {
            process: process.id,
            caller: caller_id,
        });
        let caller = self
            .store
            .get_flow_node(tx, caller_id)
            .await?
            .ok_or_else(|| WorkError::not_found("flow node", caller_id))?;
        self.store
            .set_flow_node_state(tx, caller_id, caller.state_id + 1, true)
            .await
    }

    async fn is_merge_condition_fulfilled(
        &self,
        _tx: TransactionId,
        gateway: &FlowNodeInstance,
    ) -> Result<bool> {
        self.record(Call::MergeCheck(gateway.id));
        Ok(!self
            .behavior
            .lock()
            .unwrap()
            .merge_not_fulfilled
            .contains(&gateway.id))
    }

    async fn continue_after_connector(
        &self,
        _tx: TransactionId,
        flow_node: &FlowNodeInstance,
        event: ConnectorEvent,
    ) -> Result<()> {
        self.record(Call::ContinueAfterConnector(flow_node.id, event));
        if self.behavior.lock().unwrap().fail_continue_after_connector {
            return Err(WorkError::Other("cannot continue activity".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessExecutor for RecordingEngine {
    async fn continue_after_connectors(
        &self,
        tx: TransactionId,
        process: &ProcessInstance,
        event: ConnectorEvent,
    ) -> Result<()> {
        self.record(Call::ContinueProcess(process.id, event));
        let next = match event {
            ConnectorEvent::OnEnter => ProcessState::Started,
            ConnectorEvent::OnFinish => ProcessState::Completed,
        };
        self.store.set_process_state(tx, process.id, next).await
    }

    async fn instantiate(
        &self,
        _tx: TransactionId,
        process_definition_id: i64,
        start_flow_node: Option<&str>,
        message: Option<&MessageInstance>,
    ) -> Result<i64> {
        self.record(Call::Instantiate {
            process_definition_id,
            start_flow_node: start_flow_node.map(str::to_string),
            message: message.map(|m| m.id),
        });
        Ok(self.next_process.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ConnectorExecutor for RecordingEngine {
    async fn evaluate_inputs(
        &self,
        _tx: TransactionId,
        connector: &ConnectorInstance,
    ) -> Result<ConnectorInputs> {
        self.record(Call::EvaluateInputs(connector.id));
        let mut inputs = ConnectorInputs::new();
        inputs.insert("to".to_string(), json!("ops@example.com"));
        Ok(inputs)
    }

    async fn execute(
        &self,
        connector: &ConnectorInstance,
        inputs: ConnectorInputs,
    ) -> Result<ConnectorOutputs> {
        self.record(Call::ExecuteConnector(connector.id));
        let (fail, delay) = {
            let behavior = self.behavior.lock().unwrap();
            (behavior.fail_connector, behavior.connector_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(WorkError::Other("SMTP server unreachable".to_string()));
        }
        let mut outputs = ConnectorOutputs::new();
        outputs.insert("sent".to_string(), json!(inputs.contains_key("to")));
        Ok(outputs)
    }

    async fn apply_outputs(
        &self,
        _tx: TransactionId,
        connector: &ConnectorInstance,
        _outputs: ConnectorOutputs,
    ) -> Result<()> {
        self.record(Call::ApplyOutputs(connector.id));
        if self.behavior.lock().unwrap().panic_apply_outputs {
            panic!("outputs of connector {} do not fit", connector.id);
        }
        Ok(())
    }
}

#[async_trait]
impl EventsHandler for RecordingEngine {
    async fn throw_error_event(
        &self,
        _tx: TransactionId,
        container: ContainerRef,
        error_code: &str,
    ) -> Result<ErrorEventHandling> {
        self.record(Call::ThrowErrorEvent(container, error_code.to_string()));
        let behavior = self.behavior.lock().unwrap();
        if behavior.fail_error_event {
            return Err(WorkError::Other("error event definition is broken".to_string()));
        }
        Ok(behavior.error_event.unwrap_or(ErrorEventHandling::NotCaught))
    }

    async fn trigger_catch_message(
        &self,
        _tx: TransactionId,
        waiting: &WaitingEvent,
        message: &MessageInstance,
    ) -> Result<()> {
        self.record(Call::CatchMessage {
            waiting: waiting.id,
            message: message.id,
        });
        if self.behavior.lock().unwrap().fail_catch_message {
            return Err(WorkError::Other("catch event rejected the message".to_string()));
        }
        Ok(())
    }

    async fn trigger_signal(&self, _tx: TransactionId, waiting: &WaitingEvent) -> Result<()> {
        self.record(Call::Signal(waiting.id));
        Ok(())
    }
}

/// Services over the in-memory store, wired to a [`RecordingEngine`].
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub engine: Arc<RecordingEngine>,
    pub queue: Arc<InMemoryWorkQueue>,
    pub incidents: Arc<RecordingIncidentReporter>,
    pub sessions: Arc<InMemorySessionManager>,
    pub locks: Arc<LocalLockService>,
    pub services: Arc<Services>,
    pub factory: WorkFactory,
}

/// Install a test subscriber once; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(RecordingEngine::new(store.clone()));
        let queue = Arc::new(InMemoryWorkQueue::new());
        let incidents = Arc::new(RecordingIncidentReporter::new());
        let sessions = Arc::new(InMemorySessionManager::new());
        let (locks, resubmissions) = LocalLockService::new();
        let locks = Arc::new(locks);

        let factory = WorkFactory::new(&config);
        let services = Services::builder()
            .config(config)
            .storage(store.clone())
            .engine(engine.clone())
            .queue(queue.clone())
            .incident_reporter(incidents.clone())
            .session_manager(sessions.clone())
            .lock_service(locks.clone(), Some(resubmissions))
            .build()
            .expect("Failed to build services");

        Self {
            store,
            engine,
            queue,
            incidents,
            sessions,
            locks,
            services: Arc::new(services),
            factory,
        }
    }

    /// Materialize and execute a descriptor the way a worker does.
    pub async fn run(&self, descriptor: WorkDescriptor) -> Outcome {
        let work = self.factory.create(&descriptor);
        let mut ctx = WorkContext::new(self.services.clone(), descriptor.tenant_id);
        work.execute(&mut ctx)
            .await
            .expect("Decorated works always produce an outcome")
    }
}

pub fn activity(id: i64, process_instance_id: i64, state_id: i32) -> FlowNodeInstance {
    FlowNodeInstance {
        id,
        name: format!("step-{id}"),
        kind: FlowNodeKind::Activity,
        process_definition_id: 7,
        parent_process_instance_id: process_instance_id,
        root_process_instance_id: process_instance_id,
        state_id,
        state_executing: false,
        aborting: false,
        canceling: false,
        terminal: false,
    }
}

pub fn gateway(id: i64, process_instance_id: i64, state_id: i32) -> FlowNodeInstance {
    FlowNodeInstance {
        kind: FlowNodeKind::Gateway,
        name: format!("merge-{id}"),
        ..activity(id, process_instance_id, state_id)
    }
}

pub fn terminal(node: FlowNodeInstance) -> FlowNodeInstance {
    FlowNodeInstance {
        terminal: true,
        ..node
    }
}

pub fn process(id: i64, state: ProcessState) -> ProcessInstance {
    ProcessInstance {
        id,
        process_definition_id: 7,
        root_process_instance_id: id,
        state,
        caller_id: None,
        interrupting_event_id: None,
    }
}

pub fn connector(
    id: i64,
    container: ContainerRef,
    activation_event: ConnectorEvent,
    fail_action: FailAction,
) -> ConnectorInstance {
    ConnectorInstance {
        id,
        name: "email".to_string(),
        container,
        activation_event,
        state: ConnectorState::Created,
        fail_action,
        error_code: None,
        execution_order: 0,
        failure: None,
    }
}

pub fn message(id: i64, progress: ProgressKey) -> MessageInstance {
    MessageInstance {
        id,
        message_name: "order-paid".to_string(),
        target_process: Some("orders".to_string()),
        target_flow_node: Some("wait-payment".to_string()),
        progress,
        payload: json!({ "order": 42 }),
    }
}

pub fn waiting_event(id: i64, kind: WaitingEventKind, progress: ProgressKey) -> WaitingEvent {
    WaitingEvent {
        id,
        kind,
        event_name: "order-paid".to_string(),
        process_definition_id: 7,
        process_instance_id: if kind.is_start() { None } else { Some(10) },
        flow_node_instance_id: if kind.is_start() { None } else { Some(42) },
        flow_node_name: "wait-payment".to_string(),
        progress,
    }
}
