//! Cron scheduling: recurring entries that enqueue fresh jobs on firing.

use crate::job::Job;
use crate::payload::Payload;
use chrono::Utc;
use cron::Schedule;
use gatehouse_core::ConfigError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// What a cron entry enqueues on each firing.
#[derive(Debug, Clone)]
pub struct CronSpec {
    /// Job type of the produced jobs.
    pub job_type: String,
    /// Queue the produced jobs are routed to.
    pub queue: String,
    /// Payload copied into every produced job.
    pub payload: Payload,
}

/// Identifier of a registered cron entry.
pub type CronEntryId = u64;

struct CronEntry {
    expr: String,
    cancel: CancellationToken,
}

/// Registers cron entries and runs one firing task per entry.
///
/// Expressions use seconds precision (`sec min hour day month weekday`,
/// with an optional year field).
pub(crate) struct CronScheduler {
    entries: Mutex<HashMap<CronEntryId, CronEntry>>,
    next_id: AtomicU64,
}

impl CronScheduler {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `expr` and starts firing. Each firing calls `enqueue` with
    /// a fresh job built from `spec` at the default priority.
    pub(crate) fn schedule<F>(
        &self,
        expr: &str,
        spec: CronSpec,
        parent: &CancellationToken,
        enqueue: F,
    ) -> Result<CronEntryId, ConfigError>
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        let schedule = Schedule::from_str(expr).map_err(|err| ConfigError::InvalidCron {
            expr: expr.to_string(),
            reason: err.to_string(),
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        let token = cancel.clone();
        let expr_owned = expr.to_string();

        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    // The expression has no future firings.
                    break;
                };
                let Ok(wait) = (next - Utc::now()).to_std() else {
                    continue;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        let mut job = Job::new(spec.job_type.clone(), spec.queue.clone());
                        job.payload = spec.payload.clone();
                        tracing::debug!(
                            cron = %expr_owned,
                            job_type = %job.job_type,
                            "cron entry fired"
                        );
                        enqueue(job);
                    }
                }
            }
        });

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                CronEntry {
                    expr: expr.to_string(),
                    cancel,
                },
            );
        Ok(id)
    }

    /// Stops further firings of `id`. Already-enqueued jobs are unaffected.
    pub(crate) fn unschedule(&self, id: CronEntryId) -> bool {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The registered expressions, keyed by entry id.
    pub(crate) fn entries(&self) -> Vec<(CronEntryId, String)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, entry)| (*id, entry.expr.clone()))
            .collect()
    }

    /// Cancels every entry.
    pub(crate) fn stop_all(&self) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values() {
            entry.cancel.cancel();
        }
    }
}
