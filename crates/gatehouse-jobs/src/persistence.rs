//! Best-effort snapshot persistence.
//!
//! When enabled, every known job is periodically upserted into the
//! `background_jobs` table. The snapshot is advisory: writes never block the
//! processing path, write errors are logged and skipped, and the engine
//! never reads jobs back on startup.

use crate::job::Job;
use crate::manager::ManagerInner;
use sqlx::PgPool;
use std::sync::Weak;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Persistence settings.
#[derive(Clone)]
pub struct PersistenceOptions {
    /// Connection pool for the snapshot writes.
    pub pool: PgPool,
    /// Interval between full snapshots.
    pub interval: Duration,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS background_jobs (
    id            TEXT PRIMARY KEY,
    type          TEXT NOT NULL,
    queue         TEXT NOT NULL,
    priority      TEXT NOT NULL,
    payload       JSONB NOT NULL DEFAULT '{}'::jsonb,
    status        TEXT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    scheduled_at  TIMESTAMPTZ,
    started_at    TIMESTAMPTZ,
    completed_at  TIMESTAMPTZ,
    failed_at     TIMESTAMPTZ,
    error         TEXT,
    result        JSONB,
    metadata      JSONB NOT NULL DEFAULT '{}'::jsonb
);
CREATE INDEX IF NOT EXISTS background_jobs_status_idx ON background_jobs (status);
CREATE INDEX IF NOT EXISTS background_jobs_queue_idx ON background_jobs (queue);
CREATE INDEX IF NOT EXISTS background_jobs_scheduled_at_idx ON background_jobs (scheduled_at);
"#;

const UPSERT: &str = r#"
INSERT INTO background_jobs (
    id, type, queue, priority, payload, status, attempts, max_attempts,
    created_at, updated_at, scheduled_at, started_at, completed_at,
    failed_at, error, result, metadata
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
ON CONFLICT (id) DO UPDATE SET
    type = EXCLUDED.type,
    queue = EXCLUDED.queue,
    priority = EXCLUDED.priority,
    payload = EXCLUDED.payload,
    status = EXCLUDED.status,
    attempts = EXCLUDED.attempts,
    max_attempts = EXCLUDED.max_attempts,
    updated_at = EXCLUDED.updated_at,
    scheduled_at = EXCLUDED.scheduled_at,
    started_at = EXCLUDED.started_at,
    completed_at = EXCLUDED.completed_at,
    failed_at = EXCLUDED.failed_at,
    error = EXCLUDED.error,
    result = EXCLUDED.result,
    metadata = EXCLUDED.metadata
"#;

/// Writes periodic snapshots of the engine's jobs.
pub(crate) struct Snapshotter {
    options: PersistenceOptions,
}

impl Snapshotter {
    pub(crate) fn new(options: PersistenceOptions) -> Self {
        Self { options }
    }

    /// Starts the snapshot task.
    pub(crate) fn spawn(&self, inner: Weak<ManagerInner>, cancel: CancellationToken) {
        let options = self.options.clone();
        tokio::spawn(async move {
            if let Err(err) = sqlx::raw_sql(SCHEMA).execute(&options.pool).await {
                tracing::error!(%err, "background_jobs schema setup failed, persistence disabled");
                return;
            }

            let mut ticker = tokio::time::interval(options.interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        let jobs = inner.all_jobs();
                        write_snapshot(&options.pool, &jobs).await;
                    }
                }
            }
        });
    }

    /// Writes one final snapshot, used during shutdown.
    pub(crate) async fn flush(&self, jobs: &[Job]) {
        write_snapshot(&self.options.pool, jobs).await;
    }
}

async fn write_snapshot(pool: &PgPool, jobs: &[Job]) {
    let mut written = 0usize;
    for job in jobs {
        if let Err(err) = upsert(pool, job).await {
            tracing::warn!(job_id = %job.id, %err, "job snapshot write failed");
        } else {
            written += 1;
        }
    }
    tracing::debug!(written, total = jobs.len(), "job snapshot complete");
}

async fn upsert(pool: &PgPool, job: &Job) -> sqlx::Result<()> {
    sqlx::query(UPSERT)
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(&job.queue)
        .bind(job.priority.as_str())
        .bind(sqlx::types::Json(&job.payload))
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts.map(|m| m as i32))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(&job.error)
        .bind(job.result.as_ref().map(sqlx::types::Json))
        .bind(sqlx::types::Json(&job.metadata))
        .execute(pool)
        .await?;
    Ok(())
}
