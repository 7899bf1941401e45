// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow-node execution and child notification, including redelivery.

mod common;

use common::{Call, Harness, activity, process, terminal};
use flowlatch_core::descriptor::{FinishedChild, WorkDescriptor};
use flowlatch_core::error::WorkError;
use flowlatch_core::fingerprint::StateFingerprint;
use flowlatch_core::memory::TransactionEvent;
use flowlatch_core::model::{FlowNodeInstance, ProcessState, ProgressKey, WaitingEventKind};
use flowlatch_core::work::Outcome;

#[tokio::test]
async fn test_execute_flow_node_runs_once() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    let descriptor = WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4));

    let outcome = harness.run(descriptor.clone()).await;
    assert!(matches!(outcome, Outcome::Completed));
    assert_eq!(harness.store.flow_node(42).unwrap().state_id, 5);

    // Redelivery of the same work finds the node in another state.
    match harness.run(descriptor).await {
        Outcome::Skipped { reason } => {
            assert!(reason.contains("Someone probably already called execute on it"))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.engine.count(|c| matches!(c, Call::ExecuteFlowNode(42))), 1);
    assert_eq!(harness.store.open_transactions(), 0);
    assert!(harness.incidents.incidents().is_empty());
}

#[tokio::test]
async fn test_execute_flow_node_checks_executing_flag() {
    let harness = Harness::new();
    harness.store.insert_flow_node(FlowNodeInstance {
        state_executing: true,
        ..activity(42, 10, 4)
    });

    let outcome = harness
        .run(WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4)))
        .await;

    assert!(matches!(outcome, Outcome::Skipped { .. }));
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn test_execute_failure_sets_node_failed() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness
        .store
        .insert_waiting_event(common::waiting_event(5, WaitingEventKind::MessageCatch, ProgressKey::Free));
    harness.engine.behave(|b| {
        b.fail_execute.insert(42);
    });

    let outcome = harness
        .run(WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4)))
        .await;

    match outcome {
        Outcome::Handled { cause: WorkError::Other(message) } => {
            assert_eq!(message, "flow node 42 failed")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // The engine's move to state 5 was rolled back, so the node still
    // matched the fingerprint when it was failed.
    let node = harness.store.flow_node(42).unwrap();
    assert!(node.is_failed());
    // The waiting event attached to the node is gone with it.
    assert!(harness.store.waiting_event(5).is_none());
    assert!(!harness.locks.is_locked(&flowlatch_core::lock::LockKey::process_instance(10, None)));
}

#[tokio::test]
async fn test_panic_rolls_back_and_fails_node() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness.engine.behave(|b| {
        b.panic_execute.insert(42);
    });

    let outcome = harness
        .run(WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4)))
        .await;

    match outcome {
        Outcome::Handled { cause: WorkError::Panicked(message) } => {
            assert_eq!(message, "flow node 42 exploded")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(harness.store.flow_node(42).unwrap().is_failed());

    let log = harness.store.transaction_log();
    assert!(matches!(log[0], TransactionEvent::Begin(_)));
    assert!(matches!(log[1], TransactionEvent::Rollback(_)));
    assert_eq!(harness.store.open_transactions(), 0);
    assert_eq!(harness.sessions.active_count(), 0);
    assert_eq!(harness.locks.held_count(), 0);
}

#[tokio::test]
async fn test_failed_compensation_raises_incident() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness.engine.behave(|b| {
        b.fail_execute.insert(42);
    });
    harness.store.fail_commits(true);

    let outcome = harness
        .run(
            WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4))
                .with_tenant(Some(3)),
        )
        .await;

    assert!(matches!(outcome, Outcome::IncidentReported { .. }));
    let incidents = harness.incidents.incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].cause, "flow node 42 failed");
    assert_eq!(incidents[0].tenant_id, Some(3));
    assert!(incidents[0].description.contains("flow node 42"));
    assert_eq!(
        incidents[0].context.get("flow_node_instance_id").map(String::as_str),
        Some("42")
    );
}

#[tokio::test]
async fn test_missing_flow_node_is_not_retried() {
    let harness = Harness::new();

    let outcome = harness
        .run(WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4)))
        .await;

    match outcome {
        Outcome::Handled { cause } => assert_eq!(cause.error_code(), "NOT_FOUND"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_notify_child_finished_archives_child_once() {
    let harness = Harness::new();
    harness.store.insert_flow_node(terminal(activity(43, 10, 2)));
    let descriptor = WorkDescriptor::notify_child_finished(
        7,
        10,
        FinishedChild::FlowNode {
            flow_node_instance_id: 43,
            fingerprint: StateFingerprint::stable(2),
        },
    );

    assert!(matches!(harness.run(descriptor.clone()).await, Outcome::Completed));
    assert!(harness.store.flow_node(43).is_none());

    assert!(matches!(harness.run(descriptor).await, Outcome::Skipped { .. }));
    assert_eq!(harness.engine.count(|c| matches!(c, Call::ChildFinished(43))), 1);
}

#[tokio::test]
async fn test_notify_skips_child_that_is_not_terminal() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(43, 10, 2));

    let outcome = harness
        .run(WorkDescriptor::notify_child_finished(
            7,
            10,
            FinishedChild::FlowNode {
                flow_node_instance_id: 43,
                fingerprint: StateFingerprint::stable(2),
            },
        ))
        .await;

    assert!(matches!(outcome, Outcome::Skipped { .. }));
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn test_called_process_resumes_caller_once() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(5, 10, 4));
    harness.store.insert_process(flowlatch_core::model::ProcessInstance {
        caller_id: Some(5),
        root_process_instance_id: 10,
        ..process(20, ProcessState::Completed)
    });
    let descriptor = WorkDescriptor::notify_child_finished(
        7,
        10,
        FinishedChild::Process {
            process_instance_id: 20,
            caller_id: 5,
            state: ProcessState::Completed,
        },
    );

    assert!(matches!(harness.run(descriptor.clone()).await, Outcome::Completed));
    assert!(harness.store.flow_node(5).unwrap().terminal);

    assert!(matches!(harness.run(descriptor).await, Outcome::Skipped { .. }));
    assert_eq!(
        harness.engine.calls(),
        vec![Call::ChildProcessFinished { process: 20, caller: 5 }]
    );
}
