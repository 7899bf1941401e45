// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector execution and fail actions.

mod common;

use std::time::Duration;

use common::{Call, Harness, activity, connector, process};
use flowlatch_core::config::Config;
use flowlatch_core::descriptor::{WorkDescriptor, WorkKind};
use flowlatch_core::error::WorkError;
use flowlatch_core::lock::{LockKey, LockService};
use flowlatch_core::memory::TransactionEvent;
use flowlatch_core::model::{
    ConnectorEvent, ConnectorInstance, ConnectorPhase, ConnectorState, ContainerRef, FailAction,
    ProcessState,
};
use flowlatch_core::services::ErrorEventHandling;
use flowlatch_core::work::Outcome;

fn of_activity(connector_instance_id: i64, flow_node_instance_id: i64) -> WorkDescriptor {
    WorkDescriptor::new(WorkKind::ExecuteConnectorOfActivity {
        process_definition_id: 7,
        process_instance_id: 10,
        root_process_instance_id: 10,
        flow_node_instance_id,
        connector_instance_id,
        connector_definition_name: "email".to_string(),
    })
}

fn of_process(connector_instance_id: i64, activation_event: ConnectorEvent) -> WorkDescriptor {
    WorkDescriptor::new(WorkKind::ExecuteConnectorOfProcess {
        process_definition_id: 7,
        process_instance_id: 10,
        root_process_instance_id: 10,
        connector_instance_id,
        connector_definition_name: "email".to_string(),
        activation_event,
    })
}

/// Activity 42 in state 4 with connector 5 attached on enter.
fn harness_with_activity_connector(fail_action: FailAction) -> Harness {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness.store.insert_connector(connector(
        5,
        ContainerRef::Activity(42),
        ConnectorEvent::OnEnter,
        fail_action,
    ));
    harness
}

#[tokio::test]
async fn test_connector_success_continues_activity() {
    let harness = harness_with_activity_connector(FailAction::Fail);

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Completed));
    assert_eq!(harness.store.connector(5).unwrap().state, ConnectorState::Done);
    assert_eq!(
        harness.engine.calls(),
        vec![
            Call::EvaluateInputs(5),
            Call::ExecuteConnector(5),
            Call::ApplyOutputs(5),
            Call::ContinueAfterConnector(42, ConnectorEvent::OnEnter),
        ]
    );
    assert_eq!(harness.locks.held_count(), 0);
    assert_eq!(harness.locks.acquisitions(), 1);
    assert_eq!(harness.store.open_transactions(), 0);
}

#[tokio::test]
async fn test_connector_call_runs_without_process_lock() {
    let harness = harness_with_activity_connector(FailAction::Fail);
    harness
        .engine
        .behave(|b| b.connector_delay = Some(Duration::from_millis(50)));

    let locks = harness.locks.clone();
    let lock_state_mid_call = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.is_locked(&LockKey::process_instance(10, None))
    };
    let (outcome, locked_during_call) =
        tokio::join!(harness.run(of_activity(5, 42)), lock_state_mid_call);

    assert!(matches!(outcome, Outcome::Completed));
    assert!(!locked_during_call);
    assert_eq!(harness.store.open_transactions(), 0);
}

#[tokio::test]
async fn test_fail_action_fail_sets_activity_failed() {
    let harness = harness_with_activity_connector(FailAction::Fail);
    harness.engine.behave(|b| b.fail_connector = true);

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    let connector = harness.store.connector(5).unwrap();
    assert_eq!(connector.state, ConnectorState::Failed);
    let failure = connector.failure.expect("failure recorded");
    assert_eq!(failure.phase, Some(ConnectorPhase::Execute));
    assert!(failure.message.contains("SMTP server unreachable"));
    assert!(harness.store.flow_node(42).unwrap().is_failed());
    assert_eq!(
        harness
            .engine
            .count(|c| matches!(c, Call::ContinueAfterConnector(..))),
        0
    );
    assert_eq!(harness.locks.held_count(), 0);
}

#[tokio::test]
async fn test_fail_action_retried_while_process_is_locked() {
    let harness = harness_with_activity_connector(FailAction::Fail);
    harness.engine.behave(|b| b.fail_connector = true);
    let held = harness
        .locks
        .try_lock(&LockKey::process_instance(10, None), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    match harness.run(of_activity(5, 42)).await {
        Outcome::Retry { cause } => assert_eq!(cause.error_code(), "LOCK_TIMEOUT"),
        other => panic!("unexpected outcome {other:?}"),
    }
    // Nothing was decided yet: the connector waits for the retry.
    assert_eq!(harness.store.connector(5).unwrap().state, ConnectorState::Executing);
    assert!(!harness.store.flow_node(42).unwrap().is_failed());
    assert!(harness.incidents.incidents().is_empty());

    harness.locks.unlock(held).unwrap();
    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    assert_eq!(harness.store.connector(5).unwrap().state, ConnectorState::Failed);
    assert!(harness.store.flow_node(42).unwrap().is_failed());
    assert!(harness.incidents.incidents().is_empty());
    assert_eq!(harness.locks.held_count(), 0);
}

#[tokio::test]
async fn test_panic_while_applying_outputs_rolls_back() {
    let harness = harness_with_activity_connector(FailAction::Fail);
    harness.engine.behave(|b| b.panic_apply_outputs = true);

    let outcome = harness.run(of_activity(5, 42)).await;

    match outcome {
        Outcome::Handled { cause: WorkError::Panicked(message) } => {
            assert_eq!(message, "outputs of connector 5 do not fit")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.store.open_transactions(), 0);
    assert!(
        harness
            .store
            .transaction_log()
            .iter()
            .any(|event| matches!(event, TransactionEvent::Rollback(_)))
    );
    assert_eq!(harness.store.connector(5).unwrap().state, ConnectorState::Failed);
    assert!(harness.store.flow_node(42).unwrap().is_failed());
    assert_eq!(
        harness
            .engine
            .count(|c| matches!(c, Call::ContinueAfterConnector(..))),
        0
    );
    assert_eq!(harness.locks.held_count(), 0);
}

#[tokio::test]
async fn test_fail_action_ignore_continues_activity() {
    let harness = harness_with_activity_connector(FailAction::Ignore);
    harness.engine.behave(|b| b.fail_connector = true);

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    assert_eq!(harness.store.connector(5).unwrap().state, ConnectorState::Failed);
    assert!(!harness.store.flow_node(42).unwrap().is_failed());
    assert_eq!(
        harness
            .engine
            .count(|c| *c == Call::ContinueAfterConnector(42, ConnectorEvent::OnEnter)),
        1
    );
}

#[tokio::test]
async fn test_caught_error_event_leaves_activity_alone() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness.store.insert_connector(ConnectorInstance {
        error_code: Some("MAIL_DOWN".to_string()),
        ..connector(5, ContainerRef::Activity(42), ConnectorEvent::OnEnter, FailAction::ErrorEvent)
    });
    harness.engine.behave(|b| {
        b.fail_connector = true;
        b.error_event = Some(ErrorEventHandling::Caught);
    });

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    assert_eq!(
        harness.engine.count(|c| {
            *c == Call::ThrowErrorEvent(ContainerRef::Activity(42), "MAIL_DOWN".to_string())
        }),
        1
    );
    assert!(!harness.store.flow_node(42).unwrap().is_failed());
    assert_eq!(harness.store.connector(5).unwrap().state, ConnectorState::Failed);
}

#[tokio::test]
async fn test_uncaught_error_event_fails_activity() {
    let harness = harness_with_activity_connector(FailAction::ErrorEvent);
    harness.engine.behave(|b| b.fail_connector = true);

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    // Without an error code of its own, the connector throws the default one.
    assert_eq!(
        harness.engine.count(|c| {
            *c == Call::ThrowErrorEvent(ContainerRef::Activity(42), "CONNECTOR_FAILED".to_string())
        }),
        1
    );
    assert!(harness.store.flow_node(42).unwrap().is_failed());
}

#[tokio::test]
async fn test_broken_fail_action_falls_back_to_failing_everything() {
    let harness = harness_with_activity_connector(FailAction::Ignore);
    harness.engine.behave(|b| b.fail_continue_after_connector = true);

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    // Continuing failed after the call, and again when ignoring the failure.
    assert_eq!(
        harness
            .engine
            .count(|c| matches!(c, Call::ContinueAfterConnector(42, _))),
        2
    );
    let connector = harness.store.connector(5).unwrap();
    assert_eq!(connector.state, ConnectorState::Failed);
    assert!(harness.store.flow_node(42).unwrap().is_failed());
    assert!(harness.incidents.incidents().is_empty());
    assert_eq!(harness.locks.held_count(), 0);
}

#[tokio::test]
async fn test_process_connector_failure_sets_process_in_error() {
    let harness = Harness::new();
    harness.store.insert_process(process(10, ProcessState::Initializing));
    harness.store.insert_connector(connector(
        6,
        ContainerRef::Process(10),
        ConnectorEvent::OnEnter,
        FailAction::Fail,
    ));
    harness.engine.behave(|b| b.fail_connector = true);

    let outcome = harness.run(of_process(6, ConnectorEvent::OnEnter)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    assert_eq!(harness.store.process(10).unwrap().state, ProcessState::Error);
    let archived = harness.store.archived_process_states(10);
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].state, ProcessState::Initializing);
}

#[tokio::test]
async fn test_process_connector_success_resumes_process() {
    let harness = Harness::new();
    harness.store.insert_process(process(10, ProcessState::Completing));
    harness.store.insert_connector(connector(
        6,
        ContainerRef::Process(10),
        ConnectorEvent::OnFinish,
        FailAction::Fail,
    ));

    let outcome = harness.run(of_process(6, ConnectorEvent::OnFinish)).await;

    assert!(matches!(outcome, Outcome::Completed));
    assert_eq!(
        harness
            .engine
            .count(|c| *c == Call::ContinueProcess(10, ConnectorEvent::OnFinish)),
        1
    );
    assert_eq!(harness.store.process(10).unwrap().state, ProcessState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_connector_timeout_applies_fail_action() {
    let harness = Harness::with_config(Config {
        connector_timeout: Duration::from_secs(1),
        ..Config::default()
    });
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness.store.insert_connector(connector(
        5,
        ContainerRef::Activity(42),
        ConnectorEvent::OnEnter,
        FailAction::Fail,
    ));
    harness
        .engine
        .behave(|b| b.connector_delay = Some(Duration::from_secs(60)));

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Handled { .. }));
    let failure = harness.store.connector(5).unwrap().failure.expect("failure recorded");
    assert_eq!(failure.phase, Some(ConnectorPhase::Execute));
    assert!(failure.message.contains("timed out after 1s"));
    assert!(harness.store.flow_node(42).unwrap().is_failed());
    assert_eq!(harness.engine.count(|c| matches!(c, Call::ApplyOutputs(_))), 0);
}

#[tokio::test]
async fn test_finished_connector_is_not_run_again() {
    let harness = Harness::new();
    harness.store.insert_flow_node(activity(42, 10, 4));
    harness.store.insert_connector(ConnectorInstance {
        state: ConnectorState::Done,
        ..connector(5, ContainerRef::Activity(42), ConnectorEvent::OnEnter, FailAction::Fail)
    });

    let outcome = harness.run(of_activity(5, 42)).await;

    assert!(matches!(outcome, Outcome::Skipped { .. }));
    assert!(harness.engine.calls().is_empty());
}
