// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool draining the work queue.
//!
//! The pool claims works from [`crate::queue::WorkQueue`], materializes them
//! with [`WorkFactory`] and runs up to `worker_count` of them concurrently.
//! Each queue entry is acknowledged according to the outcome of its work:
//!
//! | Outcome              | Acknowledgement                                    |
//! |----------------------|----------------------------------------------------|
//! | `Retry`              | redelivered after `retry_delay * attempt`, until    |
//! |                      | `max_attempts`, then failed with an incident        |
//! | `Deferred`           | completed; the lock service resubmits the work      |
//! | anything else        | completed                                           |

use crate::descriptor::WorkDescriptor;
use crate::error::Result;
use crate::factory::WorkFactory;
use crate::incident::Incident;
use crate::lock::Resubmissions;
use crate::queue::QueuedWork;
use crate::services::Services;
use crate::work::{Outcome, WorkContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Runs queued works with bounded concurrency.
pub struct WorkerPool {
    services: Arc<Services>,
    factory: WorkFactory,
}

impl WorkerPool {
    /// Pool over the services' queue and configuration.
    pub fn new(services: Arc<Services>) -> Self {
        let factory = WorkFactory::new(&services.config);
        Self { services, factory }
    }

    /// Claim and execute works until `shutdown` turns true, then wait for
    /// the works in flight.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let worker_count = self.services.config.worker_count.max(1);
        let permits = Arc::new(Semaphore::new(worker_count));
        let notifier = self.services.queue.notifier();
        let poll_interval = self.services.config.poll_interval;

        info!(worker_count, "Worker pool started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }

                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.services.queue.dequeue().await {
                Ok(Some(queued)) => {
                    let services = self.services.clone();
                    let factory = self.factory.clone();
                    tokio::spawn(async move {
                        execute_queued(&services, &factory, queued).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if idle(&mut shutdown, notifier.as_deref(), poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to claim work");
                    if idle(&mut shutdown, notifier.as_deref(), poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!("Worker pool draining");
        // Every permit back means every spawned work finished.
        if let Ok(all) = permits.acquire_many(worker_count as u32).await {
            drop(all);
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

/// Wait for new work, the poll interval, or shutdown. Returns whether the
/// pool must stop.
async fn idle(
    shutdown: &mut watch::Receiver<bool>,
    notifier: Option<&Notify>,
    poll_interval: Duration,
) -> bool {
    tokio::select! {
        biased;

        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = wait_for_work(notifier) => false,
        _ = tokio::time::sleep(poll_interval) => false,
    }
}

async fn wait_for_work(notifier: Option<&Notify>) {
    match notifier {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Execute one claimed work and acknowledge its queue entry.
pub async fn execute_queued(
    services: &Arc<Services>,
    factory: &WorkFactory,
    queued: QueuedWork,
) -> Outcome {
    let descriptor = &queued.descriptor;
    let span = info_span!(
        "work",
        queue_id = queued.id,
        work_type = descriptor.type_tag(),
        attempt = queued.attempt,
        tenant_id = ?descriptor.tenant_id,
    );

    async {
        let work = factory.create(descriptor);
        let mut ctx = WorkContext::new(services.clone(), descriptor.tenant_id);

        let outcome = match work.execute(&mut ctx).await {
            Ok(outcome) => outcome,
            // The failure-handling decorator turns errors into outcomes; a
            // chain without it can still surface one.
            Err(cause) => {
                error!(error = %cause, "Work returned an unhandled error");
                Outcome::Handled { cause }
            }
        };

        acknowledge(services, &queued, &outcome, &work.description(), &work.recovery_procedure())
            .await;
        outcome
    }
    .instrument(span)
    .await
}

async fn acknowledge(
    services: &Services,
    queued: &QueuedWork,
    outcome: &Outcome,
    description: &str,
    recovery_procedure: &str,
) {
    let config = &services.config;
    let acknowledged = match outcome {
        Outcome::Retry { cause } if queued.attempt < config.max_attempts => {
            let delay = config.retry_delay * queued.attempt;
            debug!(delay_ms = delay.as_millis() as u64, error = %cause, "Work scheduled for redelivery");
            services.queue.retry(queued.id, delay).await
        }
        Outcome::Retry { cause } => {
            warn!(attempts = queued.attempt, error = %cause, "Work out of attempts");
            let incident = Incident::new(description, recovery_procedure, cause)
                .with_tenant(queued.descriptor.tenant_id);
            services.incidents.report(&incident).await;
            services
                .queue
                .fail(queued.id, &format!("gave up after {} attempts: {}", queued.attempt, cause))
                .await
        }
        _ => services.queue.complete(queued.id).await,
    };

    if let Err(e) = acknowledged {
        warn!(queue_id = queued.id, error = %e, "Failed to acknowledge work");
    }
}

/// Feed works rejected by a busy lock back into the queue.
pub async fn pump_resubmissions(
    services: Arc<Services>,
    mut resubmissions: Resubmissions,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let descriptor: WorkDescriptor = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }

            next = resubmissions.recv() => match next {
                Some(descriptor) => descriptor,
                None => break,
            },
        };

        match services.queue.enqueue(descriptor).await {
            Ok(id) => debug!(queue_id = id, "Parked work resubmitted"),
            Err(e) => error!(error = %e, "Failed to resubmit parked work"),
        }
    }
    debug!("Resubmission pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryWorkQueue;
    use crate::queue::WorkQueue;
    use crate::testing::{NoopEngine, test_services_with_queue};

    #[tokio::test]
    async fn test_skipped_work_is_acknowledged() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let (services, _, _) = test_services_with_queue(Arc::new(NoopEngine), queue.clone());
        let factory = WorkFactory::new(&services.config);

        queue
            .enqueue(WorkDescriptor::trigger_signal(99, "go"))
            .await
            .unwrap();
        let queued = queue.dequeue().await.unwrap().unwrap();

        let outcome = execute_queued(&services, &factory, queued).await;

        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_resubmissions_are_enqueued() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let (services, _, _) = test_services_with_queue(Arc::new(NoopEngine), queue.clone());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump = tokio::spawn(pump_resubmissions(services, rx, shutdown_rx));
        tx.send(WorkDescriptor::trigger_signal(5, "go")).unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(queue.pending_descriptors(), vec![WorkDescriptor::trigger_signal(5, "go")]);
        drop(shutdown_tx);
    }
}
