// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed work queue and incident log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::descriptor::WorkDescriptor;
use crate::error::{Result, WorkError};
use crate::incident::{Incident, IncidentReporter};
use crate::queue::{QueuedWork, WorkQueue};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run the queue and incident migrations on an existing pool.
///
/// Safe to call multiple times; applied migrations are skipped.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Connect to a SQLite database file, creating it and its directory if
/// needed, and run the migrations.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            WorkError::storage(
                "create_dir",
                format!("Failed to create directory {:?}: {}", parent, e),
            )
        })?;
    }

    let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
    connect_url(&url).await
}

/// Connect to a SQLite URL and run the migrations.
pub async fn connect_url(url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .map_err(|e| WorkError::storage("connect", format!("Failed to connect to {}: {}", url, e)))?;
    run_migrations(&pool).await?;
    Ok(pool)
}

fn epoch_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Durable [`WorkQueue`] on a `work_queue` table.
///
/// Claiming flips a row from `pending` to `running` in one statement, so
/// concurrent workers never claim the same row.
#[derive(Clone)]
pub struct SqliteWorkQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
}

impl SqliteWorkQueue {
    /// Queue over an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Open (or create) the database file and run the migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(connect(path).await?))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'failed', error = ?1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn ensure_updated(id: i64, rows: u64) -> Result<()> {
        if rows == 0 {
            return Err(WorkError::Queue(format!("queue entry {} does not exist", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, descriptor: WorkDescriptor) -> Result<i64> {
        let payload = descriptor.to_json()?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO work_queue (work_type, tenant_id, descriptor, status, attempt, available_at)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4)
            RETURNING id
            "#,
        )
        .bind(descriptor.type_tag())
        .bind(descriptor.tenant_id)
        .bind(payload)
        .bind(epoch_millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        debug!(queue_id = id, work = descriptor.type_tag(), "Work enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedWork>> {
        let claimed: Option<(i64, String, i64)> = sqlx::query_as(
            r#"
            UPDATE work_queue
            SET status = 'running', attempt = attempt + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = (
                SELECT id FROM work_queue
                WHERE status = 'pending' AND available_at <= ?1
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, descriptor, attempt
            "#,
        )
        .bind(epoch_millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, payload, attempt)) = claimed else {
            return Ok(None);
        };

        match WorkDescriptor::from_json(&payload) {
            Ok(descriptor) => Ok(Some(QueuedWork {
                id,
                descriptor,
                attempt: attempt as u32,
            })),
            Err(e) => {
                // An unreadable row would be claimed forever.
                self.mark_failed(id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn complete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM work_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Self::ensure_updated(id, result.rows_affected())
    }

    async fn retry(&self, id: i64, delay: Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| WorkError::Queue(format!("retry delay out of range: {}", e)))?;
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'pending', available_at = ?1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(epoch_millis(Utc::now() + delay))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(id, result.rows_affected())?;
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, id: i64, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'failed', error = ?1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(id, result.rows_affected())
    }

    async fn recover_in_flight(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'pending', updated_at = CURRENT_TIMESTAMP
            WHERE status = 'running'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

#[derive(sqlx::FromRow)]
struct IncidentRow {
    description: String,
    recovery_procedure: String,
    cause: String,
    handling_error: Option<String>,
    tenant_id: Option<i64>,
    context: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = WorkError;

    fn try_from(row: IncidentRow) -> Result<Self> {
        Ok(Incident {
            description: row.description,
            recovery_procedure: row.recovery_procedure,
            cause: row.cause,
            handling_error: row.handling_error,
            tenant_id: row.tenant_id,
            context: serde_json::from_str(&row.context)?,
            created_at: row.created_at,
        })
    }
}

/// Persists incidents to an `incidents` table.
///
/// An incident that cannot be written is logged instead.
#[derive(Clone)]
pub struct SqliteIncidentReporter {
    pool: SqlitePool,
}

impl SqliteIncidentReporter {
    /// Reporter over an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Incidents of a tenant (or of every tenant), oldest first.
    pub async fn list_incidents(&self, tenant_id: Option<i64>) -> Result<Vec<Incident>> {
        let rows = sqlx::query_as::<_, IncidentRow>(
            r#"
            SELECT description, recovery_procedure, cause, handling_error,
                   tenant_id, context, created_at
            FROM incidents
            WHERE ?1 IS NULL OR tenant_id = ?1
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Incident::try_from).collect()
    }

    async fn insert(&self, incident: &Incident) -> Result<()> {
        let context = serde_json::to_string(&incident.context)?;
        sqlx::query(
            r#"
            INSERT INTO incidents
                (description, recovery_procedure, cause, handling_error, tenant_id, context, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&incident.description)
        .bind(&incident.recovery_procedure)
        .bind(&incident.cause)
        .bind(&incident.handling_error)
        .bind(incident.tenant_id)
        .bind(context)
        .bind(incident.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IncidentReporter for SqliteIncidentReporter {
    async fn report(&self, incident: &Incident) {
        if let Err(e) = self.insert(incident).await {
            error!(
                description = %incident.description,
                cause = %incident.cause,
                handling_error = incident.handling_error.as_deref().unwrap_or("-"),
                tenant_id = ?incident.tenant_id,
                recovery = %incident.recovery_procedure,
                error = %e,
                "Failed to persist incident"
            );
        }
    }
}
