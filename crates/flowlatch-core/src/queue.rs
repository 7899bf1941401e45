// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work queue abstraction.
//!
//! The queue stores [`WorkDescriptor`]s. A dequeued item is in flight until
//! the worker acknowledges it with [`WorkQueue::complete`],
//! [`WorkQueue::retry`] or [`WorkQueue::fail`]. Items left in flight by a
//! crash are returned to the queue by [`WorkQueue::recover_in_flight`] at
//! startup, which gives at-least-once delivery; the works' state
//! preconditions turn the duplicates into no-ops.

use crate::descriptor::WorkDescriptor;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A work claimed from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWork {
    /// Queue entry id.
    pub id: i64,
    /// What to execute.
    pub descriptor: WorkDescriptor,
    /// Delivery count, 1 on the first delivery.
    pub attempt: u32,
}

/// Durable or in-memory queue of work descriptors.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a work. Returns its entry id.
    async fn enqueue(&self, descriptor: WorkDescriptor) -> Result<i64>;

    /// Claim the oldest available work.
    async fn dequeue(&self) -> Result<Option<QueuedWork>>;

    /// Acknowledge a finished work.
    async fn complete(&self, id: i64) -> Result<()>;

    /// Make a work available again after `delay`.
    async fn retry(&self, id: i64, delay: Duration) -> Result<()>;

    /// Give up on a work.
    async fn fail(&self, id: i64, reason: &str) -> Result<()>;

    /// Return every in-flight work to the queue. Returns how many moved.
    async fn recover_in_flight(&self) -> Result<u64>;

    /// Number of works waiting to be claimed.
    async fn pending(&self) -> Result<u64>;

    /// Notified when new work arrives, if the queue supports it.
    fn notifier(&self) -> Option<Arc<Notify>> {
        None
    }
}
