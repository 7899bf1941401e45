// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process implementations of the persistence and runtime seams.
//!
//! Used by tests and by engines embedding the core without a database of
//! their own. [`InMemoryStore`] buffers each transaction's writes and applies
//! them on commit; every transaction boundary is also kept in a journal so
//! callers can check demarcation.

use crate::descriptor::WorkDescriptor;
use crate::error::{Result, WorkError};
use crate::incident::{Incident, IncidentReporter};
use crate::model::{
    ArchivedProcessState, ConnectorEvent, ConnectorFailure, ConnectorInstance, ConnectorState,
    ContainerRef, FlowNodeInstance, MessageInstance, ProcessInstance, ProcessState, ProgressKey,
    WaitingEvent,
};
use crate::persistence::{
    ConnectorStore, EventStore, FlowNodeStore, ProcessStore, TransactionId, TransactionRunner,
};
use crate::queue::{QueuedWork, WorkQueue};
use crate::work::{SessionId, SessionManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Store
// ============================================================================

/// A transaction boundary seen by [`InMemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Transaction opened.
    Begin(TransactionId),
    /// Transaction committed.
    Commit(TransactionId),
    /// Transaction rolled back.
    Rollback(TransactionId),
}

#[derive(Default, Clone)]
struct Tables {
    flow_nodes: BTreeMap<i64, FlowNodeInstance>,
    processes: BTreeMap<i64, ProcessInstance>,
    archived_processes: Vec<ArchivedProcessState>,
    connectors: BTreeMap<i64, ConnectorInstance>,
    messages: BTreeMap<i64, MessageInstance>,
    waiting_events: BTreeMap<i64, WaitingEvent>,
    instantiations: HashMap<Uuid, i64>,
}

/// A buffered write, replayed on the shared tables at commit.
#[derive(Debug, Clone)]
enum Write {
    FlowNodeState {
        id: i64,
        state_id: i32,
        terminal: bool,
    },
    Executing {
        id: i64,
        executing: bool,
    },
    ArchiveFlowNode(i64),
    ProcessState {
        id: i64,
        state: ProcessState,
        at: DateTime<Utc>,
    },
    ConnectorState {
        id: i64,
        state: ConnectorState,
    },
    ConnectorFailure {
        id: i64,
        failure: ConnectorFailure,
    },
    MessageProgress {
        id: i64,
        progress: ProgressKey,
    },
    WaitingEventProgress {
        id: i64,
        progress: ProgressKey,
    },
    DeleteMessage(i64),
    DeleteWaitingEventsOfFlowNode(i64),
    Instantiation {
        token: Uuid,
        process_instance_id: i64,
    },
}

impl Write {
    fn apply(&self, tables: &mut Tables) -> Result<()> {
        match self {
            Write::FlowNodeState {
                id,
                state_id,
                terminal,
            } => {
                let node = tables
                    .flow_nodes
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("flow node", *id))?;
                node.state_id = *state_id;
                node.terminal = *terminal;
                node.state_executing = false;
            }
            Write::Executing { id, executing } => {
                tables
                    .flow_nodes
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("flow node", *id))?
                    .state_executing = *executing;
            }
            Write::ArchiveFlowNode(id) => {
                tables.flow_nodes.remove(id);
            }
            Write::ProcessState { id, state, at } => {
                let process = tables
                    .processes
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("process", *id))?;
                let previous = process.state;
                process.state = *state;
                tables.archived_processes.push(ArchivedProcessState {
                    process_instance_id: *id,
                    state: previous,
                    archived_at: *at,
                });
            }
            Write::ConnectorState { id, state } => {
                tables
                    .connectors
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("connector", *id))?
                    .state = *state;
            }
            Write::ConnectorFailure { id, failure } => {
                let connector = tables
                    .connectors
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("connector", *id))?;
                connector.state = ConnectorState::Failed;
                connector.failure = Some(failure.clone());
            }
            Write::MessageProgress { id, progress } => {
                tables
                    .messages
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("message", *id))?
                    .progress = *progress;
            }
            Write::WaitingEventProgress { id, progress } => {
                tables
                    .waiting_events
                    .get_mut(id)
                    .ok_or_else(|| WorkError::not_found("waiting event", *id))?
                    .progress = *progress;
            }
            Write::DeleteMessage(id) => {
                tables.messages.remove(id);
            }
            Write::DeleteWaitingEventsOfFlowNode(flow_node_instance_id) => {
                tables
                    .waiting_events
                    .retain(|_, w| w.flow_node_instance_id != Some(*flow_node_instance_id));
            }
            Write::Instantiation {
                token,
                process_instance_id,
            } => {
                if tables.instantiations.contains_key(token) {
                    return Err(WorkError::transaction(
                        "record instantiation",
                        format!("instantiation {} is already recorded", token),
                    ));
                }
                tables.instantiations.insert(*token, *process_instance_id);
            }
        }
        Ok(())
    }
}

/// Snapshot of the shared tables taken at begin, with the writes made since.
struct OpenTransaction {
    view: Tables,
    writes: Vec<Write>,
}

/// Every store trait and the transaction runner over shared maps.
///
/// Each transaction works on a snapshot of the tables taken when it began.
/// Its writes are buffered and replayed on the shared tables at commit; a
/// rollback drops them. Concurrent transactions are not serialized: the last
/// commit wins row by row, except for instantiation tokens, whose second
/// record fails the commit.
///
/// Holds live flow nodes only: archiving a node removes it.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    journal: Mutex<Vec<TransactionEvent>>,
    open: Mutex<HashMap<TransactionId, OpenTransaction>>,
    next_transaction: AtomicU64,
    fail_commits: AtomicBool,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a flow node.
    pub fn insert_flow_node(&self, node: FlowNodeInstance) {
        lock(&self.tables).flow_nodes.insert(node.id, node);
    }

    /// Insert or replace a process.
    pub fn insert_process(&self, process: ProcessInstance) {
        lock(&self.tables).processes.insert(process.id, process);
    }

    /// Insert or replace a connector.
    pub fn insert_connector(&self, connector: ConnectorInstance) {
        lock(&self.tables).connectors.insert(connector.id, connector);
    }

    /// Insert or replace a message.
    pub fn insert_message(&self, message: MessageInstance) {
        lock(&self.tables).messages.insert(message.id, message);
    }

    /// Insert or replace a waiting event.
    pub fn insert_waiting_event(&self, waiting: WaitingEvent) {
        lock(&self.tables).waiting_events.insert(waiting.id, waiting);
    }

    /// Archive a flow node under `tx`, removing it from the live nodes.
    pub fn archive_flow_node(
        &self,
        tx: TransactionId,
        id: i64,
    ) -> Result<Option<FlowNodeInstance>> {
        let archived = self.read(tx, |tables| tables.flow_nodes.get(&id).cloned())?;
        self.write(tx, Write::ArchiveFlowNode(id))?;
        Ok(archived)
    }

    /// Committed copy of a flow node.
    pub fn flow_node(&self, id: i64) -> Option<FlowNodeInstance> {
        lock(&self.tables).flow_nodes.get(&id).cloned()
    }

    /// Committed copy of a process.
    pub fn process(&self, id: i64) -> Option<ProcessInstance> {
        lock(&self.tables).processes.get(&id).cloned()
    }

    /// Committed copy of a connector.
    pub fn connector(&self, id: i64) -> Option<ConnectorInstance> {
        lock(&self.tables).connectors.get(&id).cloned()
    }

    /// Committed copy of a message.
    pub fn message(&self, id: i64) -> Option<MessageInstance> {
        lock(&self.tables).messages.get(&id).cloned()
    }

    /// Committed copy of a waiting event.
    pub fn waiting_event(&self, id: i64) -> Option<WaitingEvent> {
        lock(&self.tables).waiting_events.get(&id).cloned()
    }

    /// Committed process started under an instantiation token.
    pub fn instantiation(&self, token: Uuid) -> Option<i64> {
        lock(&self.tables).instantiations.get(&token).copied()
    }

    /// Archived states of a process, oldest first.
    pub fn archived_process_states(&self, process_instance_id: i64) -> Vec<ArchivedProcessState> {
        lock(&self.tables)
            .archived_processes
            .iter()
            .filter(|archived| archived.process_instance_id == process_instance_id)
            .cloned()
            .collect()
    }

    /// Every transaction boundary so far.
    pub fn transaction_log(&self) -> Vec<TransactionEvent> {
        lock(&self.journal).clone()
    }

    /// Number of transactions neither committed nor rolled back.
    pub fn open_transactions(&self) -> usize {
        lock(&self.open).len()
    }

    /// Make every following commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    fn not_open(tx: TransactionId) -> WorkError {
        WorkError::transaction("access", format!("{} is not open", tx))
    }

    fn read<T>(&self, tx: TransactionId, query: impl FnOnce(&Tables) -> T) -> Result<T> {
        let open = lock(&self.open);
        let transaction = open.get(&tx).ok_or_else(|| Self::not_open(tx))?;
        Ok(query(&transaction.view))
    }

    fn write(&self, tx: TransactionId, write: Write) -> Result<()> {
        let mut open = lock(&self.open);
        let transaction = open.get_mut(&tx).ok_or_else(|| Self::not_open(tx))?;
        write.apply(&mut transaction.view)?;
        transaction.writes.push(write);
        Ok(())
    }

    fn close(&self, tx: TransactionId, event: TransactionEvent) -> Result<OpenTransaction> {
        let transaction = lock(&self.open).remove(&tx).ok_or_else(|| {
            WorkError::transaction("close", format!("{} is not open", tx))
        })?;
        lock(&self.journal).push(event);
        Ok(transaction)
    }
}

#[async_trait]
impl TransactionRunner for InMemoryStore {
    async fn begin(&self) -> Result<TransactionId> {
        let tx = TransactionId(self.next_transaction.fetch_add(1, Ordering::SeqCst) + 1);
        let view = lock(&self.tables).clone();
        lock(&self.open).insert(
            tx,
            OpenTransaction {
                view,
                writes: Vec::new(),
            },
        );
        lock(&self.journal).push(TransactionEvent::Begin(tx));
        Ok(tx)
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            self.close(tx, TransactionEvent::Rollback(tx))?;
            return Err(WorkError::transaction("commit", "commit refused"));
        }
        let mut tables = lock(&self.tables);
        let conflict = {
            let open = lock(&self.open);
            let transaction = open.get(&tx).ok_or_else(|| Self::not_open(tx))?;
            transaction.writes.iter().find_map(|write| match write {
                Write::Instantiation { token, .. } if tables.instantiations.contains_key(token) => {
                    Some(*token)
                }
                _ => None,
            })
        };
        if let Some(token) = conflict {
            self.close(tx, TransactionEvent::Rollback(tx))?;
            return Err(WorkError::transaction(
                "commit",
                format!("instantiation {} is already recorded", token),
            ));
        }
        let transaction = self.close(tx, TransactionEvent::Commit(tx))?;
        for write in &transaction.writes {
            // A row removed by a concurrent commit stays removed.
            if let Err(e) = write.apply(&mut tables) {
                debug!(transaction = %tx, error = %e, "Write dropped at commit");
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        self.close(tx, TransactionEvent::Rollback(tx)).map(|_| ())
    }
}

#[async_trait]
impl FlowNodeStore for InMemoryStore {
    async fn get_flow_node(&self, tx: TransactionId, id: i64) -> Result<Option<FlowNodeInstance>> {
        self.read(tx, |tables| tables.flow_nodes.get(&id).cloned())
    }

    async fn set_flow_node_state(
        &self,
        tx: TransactionId,
        id: i64,
        state_id: i32,
        terminal: bool,
    ) -> Result<()> {
        self.write(
            tx,
            Write::FlowNodeState {
                id,
                state_id,
                terminal,
            },
        )
    }

    async fn set_executing(&self, tx: TransactionId, id: i64, executing: bool) -> Result<()> {
        self.write(tx, Write::Executing { id, executing })
    }

    async fn list_flow_nodes_to_restart(
        &self,
        tx: TransactionId,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        self.read(tx, |tables| {
            tables
                .flow_nodes
                .range(after_id + 1..)
                .map(|(id, _)| *id)
                .take(limit)
                .collect()
        })
    }
}

#[async_trait]
impl ProcessStore for InMemoryStore {
    async fn get_process(&self, tx: TransactionId, id: i64) -> Result<Option<ProcessInstance>> {
        self.read(tx, |tables| tables.processes.get(&id).cloned())
    }

    async fn set_process_state(
        &self,
        tx: TransactionId,
        id: i64,
        state: ProcessState,
    ) -> Result<()> {
        self.write(
            tx,
            Write::ProcessState {
                id,
                state,
                at: Utc::now(),
            },
        )
    }

    async fn list_processes_in_states(
        &self,
        tx: TransactionId,
        states: &[ProcessState],
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        self.read(tx, |tables| {
            tables
                .processes
                .range(after_id + 1..)
                .filter(|(_, process)| states.contains(&process.state))
                .map(|(id, _)| *id)
                .take(limit)
                .collect()
        })
    }

    async fn find_instantiation(&self, tx: TransactionId, token: Uuid) -> Result<Option<i64>> {
        self.read(tx, |tables| tables.instantiations.get(&token).copied())
    }

    async fn record_instantiation(
        &self,
        tx: TransactionId,
        token: Uuid,
        process_instance_id: i64,
    ) -> Result<()> {
        self.write(
            tx,
            Write::Instantiation {
                token,
                process_instance_id,
            },
        )
    }
}

#[async_trait]
impl ConnectorStore for InMemoryStore {
    async fn get_connector(&self, tx: TransactionId, id: i64) -> Result<Option<ConnectorInstance>> {
        self.read(tx, |tables| tables.connectors.get(&id).cloned())
    }

    async fn set_connector_state(
        &self,
        tx: TransactionId,
        id: i64,
        state: ConnectorState,
    ) -> Result<()> {
        self.write(tx, Write::ConnectorState { id, state })
    }

    async fn record_connector_failure(
        &self,
        tx: TransactionId,
        id: i64,
        failure: ConnectorFailure,
    ) -> Result<()> {
        self.write(tx, Write::ConnectorFailure { id, failure })
    }

    async fn next_pending_connector(
        &self,
        tx: TransactionId,
        container: ContainerRef,
        event: ConnectorEvent,
    ) -> Result<Option<ConnectorInstance>> {
        self.read(tx, |tables| {
            tables
                .connectors
                .values()
                .filter(|c| c.container == container && c.activation_event == event)
                .filter(|c| !c.state.is_terminal())
                .min_by_key(|c| (c.execution_order, c.id))
                .cloned()
        })
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn get_message(&self, tx: TransactionId, id: i64) -> Result<Option<MessageInstance>> {
        self.read(tx, |tables| tables.messages.get(&id).cloned())
    }

    async fn get_waiting_event(&self, tx: TransactionId, id: i64) -> Result<Option<WaitingEvent>> {
        self.read(tx, |tables| tables.waiting_events.get(&id).cloned())
    }

    async fn set_message_progress(
        &self,
        tx: TransactionId,
        id: i64,
        progress: ProgressKey,
    ) -> Result<()> {
        self.write(tx, Write::MessageProgress { id, progress })
    }

    async fn set_waiting_event_progress(
        &self,
        tx: TransactionId,
        id: i64,
        progress: ProgressKey,
    ) -> Result<()> {
        self.write(tx, Write::WaitingEventProgress { id, progress })
    }

    async fn delete_message(&self, tx: TransactionId, id: i64) -> Result<()> {
        self.write(tx, Write::DeleteMessage(id))
    }

    async fn list_messages_in_progress(&self, tx: TransactionId, limit: usize) -> Result<Vec<i64>> {
        self.read(tx, |tables| {
            tables
                .messages
                .values()
                .filter(|m| m.progress == ProgressKey::InProgress)
                .map(|m| m.id)
                .take(limit)
                .collect()
        })
    }

    async fn list_waiting_events_in_progress(
        &self,
        tx: TransactionId,
        limit: usize,
    ) -> Result<Vec<i64>> {
        self.read(tx, |tables| {
            tables
                .waiting_events
                .values()
                .filter(|w| w.progress == ProgressKey::InProgress)
                .map(|w| w.id)
                .take(limit)
                .collect()
        })
    }

    async fn delete_waiting_events_of_flow_node(
        &self,
        tx: TransactionId,
        flow_node_instance_id: i64,
    ) -> Result<usize> {
        let attached = self.read(tx, |tables| {
            tables
                .waiting_events
                .values()
                .filter(|w| w.flow_node_instance_id == Some(flow_node_instance_id))
                .count()
        })?;
        self.write(tx, Write::DeleteWaitingEventsOfFlowNode(flow_node_instance_id))?;
        Ok(attached)
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    InFlight,
    Failed,
}

#[derive(Debug)]
struct QueueEntry {
    descriptor: WorkDescriptor,
    attempt: u32,
    status: EntryStatus,
    available_at: Instant,
    failure: Option<String>,
}

/// FIFO work queue held in memory. Lost with the process.
pub struct InMemoryWorkQueue {
    entries: Mutex<BTreeMap<i64, QueueEntry>>,
    next_id: AtomicU64,
    notify: Arc<Notify>,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Descriptors waiting to be claimed, in queue order.
    pub fn pending_descriptors(&self) -> Vec<WorkDescriptor> {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.status == EntryStatus::Pending)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Works given up on, with the reason.
    pub fn failed(&self) -> Vec<(WorkDescriptor, String)> {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.status == EntryStatus::Failed)
            .map(|entry| {
                (
                    entry.descriptor.clone(),
                    entry.failure.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Works claimed and not acknowledged yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.status == EntryStatus::InFlight)
            .count()
    }

    fn update(&self, id: i64, apply: impl FnOnce(&mut QueueEntry)) -> Result<()> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| WorkError::Queue(format!("queue entry {} does not exist", id)))?;
        apply(entry);
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, descriptor: WorkDescriptor) -> Result<i64> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1) as i64;
        debug!(queue_id = id, work = descriptor.type_tag(), "Work enqueued");
        lock(&self.entries).insert(
            id,
            QueueEntry {
                descriptor,
                attempt: 0,
                status: EntryStatus::Pending,
                available_at: Instant::now(),
                failure: None,
            },
        );
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedWork>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let claimed = entries
            .iter_mut()
            .find(|(_, entry)| entry.status == EntryStatus::Pending && entry.available_at <= now);
        Ok(claimed.map(|(id, entry)| {
            entry.status = EntryStatus::InFlight;
            entry.attempt += 1;
            QueuedWork {
                id: *id,
                descriptor: entry.descriptor.clone(),
                attempt: entry.attempt,
            }
        }))
    }

    async fn complete(&self, id: i64) -> Result<()> {
        lock(&self.entries)
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| WorkError::Queue(format!("queue entry {} does not exist", id)))
    }

    async fn retry(&self, id: i64, delay: Duration) -> Result<()> {
        self.update(id, |entry| {
            entry.status = EntryStatus::Pending;
            entry.available_at = Instant::now() + delay;
        })?;
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, id: i64, reason: &str) -> Result<()> {
        self.update(id, |entry| {
            entry.status = EntryStatus::Failed;
            entry.failure = Some(reason.to_string());
        })
    }

    async fn recover_in_flight(&self) -> Result<u64> {
        let mut recovered = 0;
        for entry in lock(&self.entries).values_mut() {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn pending(&self) -> Result<u64> {
        Ok(lock(&self.entries)
            .values()
            .filter(|entry| entry.status == EntryStatus::Pending)
            .count() as u64)
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

// ============================================================================
// Sessions and incidents
// ============================================================================

/// Session manager tracking sessions in memory.
#[derive(Default)]
pub struct InMemorySessionManager {
    active: Mutex<HashMap<SessionId, Option<i64>>>,
    bound: AtomicUsize,
    fail_unbind: AtomicBool,
}

impl InMemorySessionManager {
    /// Manager with no open session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions opened so far.
    pub fn bound_count(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Make every following unbind fail after closing the session.
    pub fn fail_unbind(&self, fail: bool) {
        self.fail_unbind.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn bind(&self, tenant_id: Option<i64>) -> Result<SessionId> {
        let session = SessionId::new();
        lock(&self.active).insert(session, tenant_id);
        self.bound.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn unbind(&self, session: SessionId) -> Result<()> {
        if lock(&self.active).remove(&session).is_none() {
            return Err(WorkError::Session(format!("session {} is not bound", session)));
        }
        if self.fail_unbind.load(Ordering::SeqCst) {
            return Err(WorkError::Session(format!("failed to close session {}", session)));
        }
        Ok(())
    }
}

/// Keeps reported incidents in memory.
#[derive(Default)]
pub struct RecordingIncidentReporter {
    incidents: Mutex<Vec<Incident>>,
}

impl RecordingIncidentReporter {
    /// Reporter with no incident.
    pub fn new() -> Self {
        Self::default()
    }

    /// Incidents reported so far.
    pub fn incidents(&self) -> Vec<Incident> {
        lock(&self.incidents).clone()
    }
}

#[async_trait]
impl IncidentReporter for RecordingIncidentReporter {
    async fn report(&self, incident: &Incident) {
        lock(&self.incidents).push(incident.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::StateFingerprint;
    use crate::model::FlowNodeKind;

    fn node(id: i64) -> FlowNodeInstance {
        FlowNodeInstance {
            id,
            name: format!("task-{id}"),
            kind: FlowNodeKind::Activity,
            process_definition_id: 1,
            parent_process_instance_id: 10,
            root_process_instance_id: 10,
            state_id: 3,
            state_executing: false,
            aborting: false,
            canceling: false,
            terminal: false,
        }
    }

    fn process(id: i64, state: ProcessState) -> ProcessInstance {
        ProcessInstance {
            id,
            process_definition_id: 1,
            root_process_instance_id: id,
            state,
            caller_id: None,
            interrupting_event_id: None,
        }
    }

    #[tokio::test]
    async fn test_restart_listing_pages_by_id() {
        let store = InMemoryStore::new();
        for id in [4, 1, 9, 7] {
            store.insert_flow_node(node(id));
        }
        let tx = store.begin().await.unwrap();

        assert_eq!(store.list_flow_nodes_to_restart(tx, 0, 2).await.unwrap(), vec![1, 4]);
        assert_eq!(store.list_flow_nodes_to_restart(tx, 4, 2).await.unwrap(), vec![7, 9]);
        assert!(store.list_flow_nodes_to_restart(tx, 9, 2).await.unwrap().is_empty());
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_state_change_archives_previous_state() {
        let store = InMemoryStore::new();
        store.insert_process(process(10, ProcessState::Initializing));

        let tx = store.begin().await.unwrap();
        store.set_process_state(tx, 10, ProcessState::Started).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(store.process(10).unwrap().state, ProcessState::Started);
        let archived = store.archived_process_states(10);
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, ProcessState::Initializing);
    }

    #[tokio::test]
    async fn test_rolled_back_writes_are_not_visible() {
        let store = InMemoryStore::new();
        store.insert_flow_node(node(42));
        store.insert_process(process(10, ProcessState::Started));

        let tx = store.begin().await.unwrap();
        store.set_flow_node_state(tx, 42, 4, true).await.unwrap();
        store.set_process_state(tx, 10, ProcessState::Completed).await.unwrap();
        // The transaction reads its own writes, others do not.
        assert_eq!(store.get_flow_node(tx, 42).await.unwrap().unwrap().state_id, 4);
        let other = store.begin().await.unwrap();
        assert_eq!(store.get_flow_node(other, 42).await.unwrap().unwrap().state_id, 3);
        store.rollback(other).await.unwrap();
        assert_eq!(store.flow_node(42).unwrap().state_id, 3);

        store.rollback(tx).await.unwrap();

        let node = store.flow_node(42).unwrap();
        assert_eq!(node.state_id, 3);
        assert!(!node.terminal);
        assert_eq!(store.process(10).unwrap().state, ProcessState::Started);
        assert!(store.archived_process_states(10).is_empty());
    }

    #[tokio::test]
    async fn test_refused_commit_discards_writes() {
        let store = InMemoryStore::new();
        store.insert_flow_node(node(42));
        store.fail_commits(true);

        let tx = store.begin().await.unwrap();
        store.set_executing(tx, 42, true).await.unwrap();
        assert!(store.commit(tx).await.is_err());

        assert!(!store.flow_node(42).unwrap().state_executing);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_instantiation_token_is_recorded_once() {
        let store = InMemoryStore::new();
        let token = Uuid::new_v4();

        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();
        assert_eq!(store.find_instantiation(second, token).await.unwrap(), None);
        store.record_instantiation(first, token, 1000).await.unwrap();
        store.record_instantiation(second, token, 1001).await.unwrap();

        store.commit(first).await.unwrap();
        assert!(store.commit(second).await.is_err());

        assert_eq!(store.instantiation(token), Some(1000));
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_store_calls_need_an_open_transaction() {
        let store = InMemoryStore::new();
        store.insert_flow_node(node(42));
        let tx = store.begin().await.unwrap();
        store.commit(tx).await.unwrap();

        assert!(store.get_flow_node(tx, 42).await.is_err());
        assert!(store.set_executing(tx, 42, true).await.is_err());
    }

    #[tokio::test]
    async fn test_transactions_are_journaled() {
        let store = InMemoryStore::new();
        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();
        assert_eq!(store.open_transactions(), 2);

        store.commit(first).await.unwrap();
        store.rollback(second).await.unwrap();

        assert_eq!(store.open_transactions(), 0);
        assert_eq!(
            store.transaction_log(),
            vec![
                TransactionEvent::Begin(first),
                TransactionEvent::Begin(second),
                TransactionEvent::Commit(first),
                TransactionEvent::Rollback(second),
            ]
        );
        assert!(store.commit(first).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_redelivers_after_delay() {
        let queue = InMemoryWorkQueue::new();
        let descriptor = WorkDescriptor::execute_flow_node(1, 10, 42, StateFingerprint::stable(3));
        let id = queue.enqueue(descriptor.clone()).await.unwrap();

        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.retry(id, Duration::from_secs(1)).await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
        assert_eq!(claimed.descriptor, descriptor);

        queue.complete(id).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_in_flight_returns_claimed_works() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue(WorkDescriptor::trigger_signal(5, "go"))
            .await
            .unwrap();
        queue.dequeue().await.unwrap().unwrap();

        assert_eq!(queue.recover_in_flight().await.unwrap(), 1);
        assert_eq!(queue.pending().await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unbinding_unknown_session_fails() {
        let sessions = InMemorySessionManager::new();
        let session = sessions.bind(Some(1)).await.unwrap();
        sessions.unbind(session).await.unwrap();

        assert!(sessions.unbind(session).await.is_err());
        assert_eq!(sessions.bound_count(), 1);
        assert_eq!(sessions.active_count(), 0);
    }
}
