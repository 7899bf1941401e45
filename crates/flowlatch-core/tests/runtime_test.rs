// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded runtime: restart, worker pool and shutdown.

mod common;

use std::time::Duration;

use common::{Call, Harness, activity, terminal};
use flowlatch_core::config::Config;
use flowlatch_core::descriptor::{FinishedChild, WorkDescriptor};
use flowlatch_core::fingerprint::StateFingerprint;
use flowlatch_core::lock::{LockKey, LockService};
use flowlatch_core::queue::WorkQueue;
use flowlatch_core::runtime::WorkRuntime;

/// Poll `condition` until it holds or five seconds passed.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn fast() -> Config {
    Config {
        worker_count: 4,
        poll_interval: Duration::from_millis(10),
        lock_timeout: Duration::from_secs(1),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_submitted_work_is_executed() {
    let harness = Harness::with_config(fast());
    harness.store.insert_flow_node(activity(42, 10, 4));

    let runtime = WorkRuntime::builder()
        .services(harness.services.clone())
        .restart(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());
    assert_eq!(runtime.restart_report().works_registered(), 0);

    runtime
        .submit(WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4)))
        .await
        .unwrap();

    assert!(eventually(|| harness.store.flow_node(42).map(|n| n.state_id) == Some(5)).await);
    runtime.shutdown().await.unwrap();

    assert_eq!(harness.queue.pending().await.unwrap(), 0);
    assert_eq!(harness.queue.in_flight(), 0);
}

#[tokio::test]
async fn test_startup_restart_feeds_the_workers() {
    let harness = Harness::with_config(fast());
    harness.store.insert_flow_node(activity(41, 10, 4));
    harness.store.insert_flow_node(terminal(activity(42, 11, 6)));

    let runtime = WorkRuntime::builder()
        .services(harness.services.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(runtime.restart_report().flow_nodes_restarted, 1);
    assert_eq!(runtime.restart_report().flow_nodes_notified, 1);

    assert!(
        eventually(|| {
            harness.store.flow_node(41).map(|n| n.state_id) == Some(5)
                && harness.store.flow_node(42).is_none()
        })
        .await
    );
    runtime.shutdown().await.unwrap();
    assert_eq!(harness.engine.count(|c| matches!(c, Call::ExecuteFlowNode(41))), 1);
}

#[tokio::test]
async fn test_deferred_work_comes_back_through_the_queue() {
    let harness = Harness::with_config(fast());
    harness.store.insert_flow_node(activity(41, 10, 4));
    harness.store.insert_flow_node(terminal(activity(43, 10, 2)));
    harness
        .engine
        .behave(|b| b.execute_delay = Some(Duration::from_millis(100)));

    let runtime = WorkRuntime::builder()
        .services(harness.services.clone())
        .restart(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    // The notification arrives while the execution holds the process lock.
    runtime
        .submit(WorkDescriptor::execute_flow_node(7, 10, 41, StateFingerprint::stable(4)))
        .await
        .unwrap();
    assert!(eventually(|| harness.engine.count(|c| matches!(c, Call::ExecuteFlowNode(41))) == 1).await);
    runtime
        .submit(WorkDescriptor::notify_child_finished(
            7,
            10,
            FinishedChild::FlowNode {
                flow_node_instance_id: 43,
                fingerprint: StateFingerprint::stable(2),
            },
        ))
        .await
        .unwrap();

    assert!(eventually(|| harness.store.flow_node(43).is_none()).await);
    runtime.shutdown().await.unwrap();

    assert_eq!(harness.engine.count(|c| matches!(c, Call::ChildFinished(43))), 1);
    assert!(harness.queue.failed().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_raise_incident() {
    let harness = Harness::with_config(Config {
        max_attempts: 2,
        retry_delay: Duration::from_millis(5),
        lock_timeout: Duration::from_millis(5),
        ..fast()
    });
    harness.store.insert_flow_node(activity(42, 10, 4));
    let held = harness
        .locks
        .try_lock(&LockKey::process_instance(10, None), Duration::ZERO)
        .await
        .unwrap()
        .expect("lock is free");

    let runtime = WorkRuntime::builder()
        .services(harness.services.clone())
        .restart(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    runtime
        .submit(WorkDescriptor::execute_flow_node(7, 10, 42, StateFingerprint::stable(4)))
        .await
        .unwrap();

    assert!(eventually(|| !harness.queue.failed().is_empty()).await);
    runtime.shutdown().await.unwrap();

    let failed = harness.queue.failed();
    assert!(failed[0].1.contains("gave up after 2 attempts"));
    let incidents = harness.incidents.incidents();
    assert_eq!(incidents.len(), 1);
    assert!(incidents[0].cause.contains("Unable to lock PROCESS:10"));
    assert!(harness.engine.calls().is_empty());

    harness.locks.unlock(held).unwrap();
}
