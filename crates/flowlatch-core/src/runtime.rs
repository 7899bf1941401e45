// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for flowlatch-core.
//!
//! [`WorkRuntime`] runs the restart sequence and then the worker pool inside
//! an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowlatch_core::memory::InMemoryStore;
//! use flowlatch_core::runtime::WorkRuntime;
//! use flowlatch_core::services::Services;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let services = Services::builder()
//!         .storage(Arc::new(InMemoryStore::new()))
//!         .engine(Arc::new(MyEngine::new()))
//!         .build()?;
//!
//!     let runtime = WorkRuntime::builder()
//!         .services(Arc::new(services))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.submit(descriptor).await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::descriptor::WorkDescriptor;
use crate::restart::{RestartReport, RestartService};
use crate::services::Services;
use crate::worker::{WorkerPool, pump_resubmissions};

/// Builder for creating a [`WorkRuntime`].
pub struct WorkRuntimeBuilder {
    services: Option<Arc<Services>>,
    restart: bool,
}

impl std::fmt::Debug for WorkRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRuntimeBuilder")
            .field("services", &self.services.as_ref().map(|_| "..."))
            .field("restart", &self.restart)
            .finish()
    }
}

impl Default for WorkRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkRuntimeBuilder {
    /// Create a new builder. The restart sequence runs by default.
    pub fn new() -> Self {
        Self {
            services: None,
            restart: true,
        }
    }

    /// Set the services bundle (required).
    pub fn services(mut self, services: Arc<Services>) -> Self {
        self.services = Some(services);
        self
    }

    /// Whether to run the restart handlers before starting the workers.
    ///
    /// Default: `true`
    pub fn restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<WorkRuntimeConfig> {
        let services = self
            .services
            .ok_or_else(|| anyhow::anyhow!("services are required"))?;

        Ok(WorkRuntimeConfig {
            services,
            restart: self.restart,
        })
    }
}

/// Configuration for a [`WorkRuntime`].
pub struct WorkRuntimeConfig {
    services: Arc<Services>,
    restart: bool,
}

impl std::fmt::Debug for WorkRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRuntimeConfig")
            .field("services", &"...")
            .field("restart", &self.restart)
            .finish()
    }
}

impl WorkRuntimeConfig {
    /// Recover the queue, run the restart handlers, then spawn the workers.
    ///
    /// Workers only start once the restart sequence succeeded.
    pub async fn start(self) -> Result<WorkRuntime> {
        let services = self.services;

        let recovered = services.queue.recover_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "Returned in-flight works to the queue");
        }

        let restart_report = if self.restart {
            RestartService::new(services.config.restart_batch_size)
                .run(&services)
                .await?
        } else {
            RestartReport::default()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump_handle = services.take_resubmissions().map(|resubmissions| {
            tokio::spawn(pump_resubmissions(
                services.clone(),
                resubmissions,
                shutdown_rx.clone(),
            ))
        });

        let pool_handle = tokio::spawn(WorkerPool::new(services.clone()).run(shutdown_rx));

        info!(
            worker_count = services.config.worker_count,
            works_registered = restart_report.works_registered(),
            "WorkRuntime started"
        );

        Ok(WorkRuntime {
            pool_handle,
            pump_handle,
            shutdown_tx,
            services,
            restart_report,
        })
    }
}

/// A running work-execution core embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct WorkRuntime {
    pool_handle: JoinHandle<crate::error::Result<()>>,
    pump_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    services: Arc<Services>,
    restart_report: RestartReport,
}

impl WorkRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkRuntimeBuilder {
        WorkRuntimeBuilder::new()
    }

    /// Register a work for execution. Returns its queue entry id.
    pub async fn submit(&self, descriptor: WorkDescriptor) -> crate::error::Result<i64> {
        self.services.queue.enqueue(descriptor).await
    }

    /// What the restart sequence did at startup.
    pub fn restart_report(&self) -> &RestartReport {
        &self.restart_report
    }

    /// Get a reference to the services bundle.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Check if the worker pool is still running.
    pub fn is_running(&self) -> bool {
        !self.pool_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops claiming new works and waits for the works in flight.
    pub async fn shutdown(self) -> Result<()> {
        info!("WorkRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        if let Some(pump) = self.pump_handle
            && let Err(e) = pump.await
        {
            error!("Resubmission pump panicked: {}", e);
        }

        match self.pool_handle.await {
            Ok(Ok(())) => {
                info!("WorkRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Worker pool error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("Worker pool task panicked: {}", e);
                Err(anyhow::anyhow!("worker pool task panicked: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_services() {
        let result = WorkRuntime::builder().build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("services"));
    }

    #[test]
    fn test_builder_runs_restart_by_default() {
        let builder = WorkRuntime::builder();
        assert!(builder.restart);
        assert!(!builder.restart(false).restart);
    }
}
