// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-process-instance locking.
//!
//! Two acquisition modes are offered:
//!
//! - **Bounded wait** ([`LockService::try_lock`]): wait up to a timeout, then
//!   give up. Callers turn the failure into a retryable
//!   [`WorkError::LockTimeout`].
//! - **Rejection with requeue** ([`LockService::try_lock_or_requeue`]): fail
//!   immediately, but remember the work descriptor. When the holder releases
//!   the lock the descriptor is pushed on the resubmission channel, which the
//!   worker pool drains back into the queue.
//!
//! A [`ResourceLock`] is not `Clone` and [`LockService::unlock`] consumes it,
//! so each acquisition is released at most once. [`LockGuard`] releases on
//! drop, which also covers unwinding.

use crate::descriptor::WorkDescriptor;
use crate::error::{Result, WorkError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

/// Receiving end of the requeue-on-release channel.
pub type Resubmissions = mpsc::UnboundedReceiver<WorkDescriptor>;

/// Resource type for process-instance locks.
pub const PROCESS_RESOURCE: &str = "PROCESS";

/// Identifies a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    /// Resource identifier.
    pub resource_id: i64,
    /// Resource type, e.g. `PROCESS`.
    pub resource_type: String,
    /// Tenant owning the resource.
    pub tenant_id: Option<i64>,
}

impl LockKey {
    /// Key of a process instance.
    pub fn process_instance(process_instance_id: i64, tenant_id: Option<i64>) -> Self {
        Self {
            resource_id: process_instance_id,
            resource_type: PROCESS_RESOURCE.to_string(),
            tenant_id,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tenant_id {
            Some(tenant) => write!(f, "{}:{}@{}", self.resource_type, self.resource_id, tenant),
            None => write!(f, "{}:{}", self.resource_type, self.resource_id),
        }
    }
}

/// Proof of a held lock. Hand it back to [`LockService::unlock`] exactly once.
#[derive(Debug)]
pub struct ResourceLock {
    key: LockKey,
    token: u64,
}

impl ResourceLock {
    /// Locked resource.
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

/// Mutual exclusion over process instances.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the lock, waiting at most `timeout`. `None` when the wait expired.
    async fn try_lock(&self, key: &LockKey, timeout: Duration) -> Result<Option<ResourceLock>>;

    /// Acquire the lock without waiting. When it is held, `work` is recorded
    /// and resubmitted once the holder releases, and `None` is returned.
    async fn try_lock_or_requeue(
        &self,
        key: &LockKey,
        work: &WorkDescriptor,
    ) -> Result<Option<ResourceLock>>;

    /// Release a lock.
    fn unlock(&self, lock: ResourceLock) -> Result<()>;
}

/// Releases its lock when dropped.
pub struct LockGuard<'a> {
    service: &'a dyn LockService,
    lock: Option<ResourceLock>,
}

impl<'a> LockGuard<'a> {
    /// Guard a lock acquired from `service`.
    pub fn new(service: &'a dyn LockService, lock: ResourceLock) -> Self {
        Self {
            service,
            lock: Some(lock),
        }
    }

    /// Release now and report the outcome.
    pub fn release(mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => self.service.unlock(lock),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let key = lock.key().clone();
            if let Err(e) = self.service.unlock(lock) {
                warn!(lock = %key, error = %e, "Failed to release lock on drop");
            }
        }
    }
}

struct HeldLock {
    token: u64,
    waiting: Vec<WorkDescriptor>,
}

/// In-process lock service.
///
/// Suitable for a single engine node. Waiters of [`LockService::try_lock`]
/// are woken on every release and re-check their key.
pub struct LocalLockService {
    held: Mutex<HashMap<LockKey, HeldLock>>,
    released: Notify,
    next_token: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    resubmit: mpsc::UnboundedSender<WorkDescriptor>,
}

impl LocalLockService {
    /// Create a lock service and the channel on which rejected works come back.
    pub fn new() -> (Self, Resubmissions) {
        let (resubmit, resubmissions) = mpsc::unbounded_channel();
        let service = Self {
            held: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_token: AtomicU64::new(1),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            resubmit,
        };
        (service, resubmissions)
    }

    /// Whether the key is currently held.
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.table().contains_key(key)
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        self.table().len()
    }

    /// Total successful acquisitions.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Total releases.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<LockKey, HeldLock>> {
        // The table holds no invariants a panicking holder could break half-way.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, key: &LockKey, requeue: Option<&WorkDescriptor>) -> Option<ResourceLock> {
        let mut held = self.table();
        if let Some(entry) = held.get_mut(key) {
            if let Some(work) = requeue {
                entry.waiting.push(work.clone());
            }
            return None;
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        held.insert(
            key.clone(),
            HeldLock {
                token,
                waiting: Vec::new(),
            },
        );
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Some(ResourceLock {
            key: key.clone(),
            token,
        })
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn try_lock(&self, key: &LockKey, timeout: Duration) -> Result<Option<ResourceLock>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a release in between is not missed.
            let released = self.released.notified();
            if let Some(lock) = self.acquire(key, None) {
                return Ok(Some(lock));
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                debug!(lock = %key, timeout_ms = timeout.as_millis() as u64, "Lock wait expired");
                return Ok(self.acquire(key, None));
            }
        }
    }

    async fn try_lock_or_requeue(
        &self,
        key: &LockKey,
        work: &WorkDescriptor,
    ) -> Result<Option<ResourceLock>> {
        let lock = self.acquire(key, Some(work));
        if lock.is_none() {
            debug!(lock = %key, work = work.type_tag(), "Lock busy, work parked until release");
        }
        Ok(lock)
    }

    fn unlock(&self, lock: ResourceLock) -> Result<()> {
        let waiting = {
            let mut held = self.table();
            match held.get(&lock.key) {
                Some(entry) if entry.token == lock.token => {}
                _ => {
                    return Err(WorkError::Other(format!(
                        "Lock {} is not held by this owner",
                        lock.key
                    )));
                }
            }
            held.remove(&lock.key).map(|entry| entry.waiting).unwrap_or_default()
        };

        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released.notify_waiters();

        for work in waiting {
            if self.resubmit.send(work).is_err() {
                warn!(lock = %lock.key, "Resubmission channel closed, parked work dropped");
            }
        }
        Ok(())
    }
}
