//! Long-lived queue workers and the per-queue worker pool.

use crate::processor::{ProcessOutcome, Processor};
use crate::queue::{JobQueue, QueueKind, QueueSet};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Activity state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub queue: String,
    pub status: WorkerStatus,
    pub current_job: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_count: u64,
    pub failed_count: u64,
}

struct WorkerShared {
    id: u64,
    queue: String,
    status: Mutex<WorkerStatus>,
    current_job: Mutex<Option<String>>,
    started_at: DateTime<Utc>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerShared {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            queue: self.queue.clone(),
            status: *self.status.lock().unwrap_or_else(|e| e.into_inner()),
            current_job: self
                .current_job
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            started_at: self.started_at,
            completed_count: self.completed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn set_current(&self, job_id: Option<String>) {
        *self.current_job.lock().unwrap_or_else(|e| e.into_inner()) = job_id;
    }
}

pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    fn stop(&self) {
        self.cancel.cancel();
        self.shared.set_status(WorkerStatus::Stopped);
    }
}

fn spawn_worker(
    id: u64,
    queue: Arc<JobQueue>,
    processor: Arc<Processor>,
    parent: &CancellationToken,
) -> WorkerHandle {
    let cancel = parent.child_token();
    let shared = Arc::new(WorkerShared {
        id,
        queue: queue.name().to_string(),
        status: Mutex::new(WorkerStatus::Idle),
        current_job: Mutex::new(None),
        started_at: Utc::now(),
        completed: AtomicU64::new(0),
        failed: AtomicU64::new(0),
    });

    let state = Arc::clone(&shared);
    let token = cancel.clone();
    tokio::spawn(async move {
        tracing::debug!(worker = id, queue = queue.name(), "worker started");
        loop {
            let Some(job) = queue.pop(&token).await else {
                break;
            };
            state.set_status(WorkerStatus::Busy);
            state.set_current(Some(job.id.clone()));

            match processor.process(job, &token).await {
                ProcessOutcome::Completed => {
                    state.completed.fetch_add(1, Ordering::Relaxed);
                }
                ProcessOutcome::Failed => {
                    state.failed.fetch_add(1, Ordering::Relaxed);
                }
                ProcessOutcome::Retried => {}
            }

            state.set_current(None);
            state.set_status(WorkerStatus::Idle);
        }
        state.set_status(WorkerStatus::Stopped);
        tracing::debug!(worker = id, "worker stopped");
    });

    WorkerHandle { shared, cancel }
}

/// Manages the workers bound to each queue.
pub(crate) struct WorkerPool {
    processor: Arc<Processor>,
    queues: Arc<QueueSet>,
    root: CancellationToken,
    workers: Mutex<HashMap<String, Vec<WorkerHandle>>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub(crate) fn new(
        processor: Arc<Processor>,
        queues: Arc<QueueSet>,
        root: CancellationToken,
    ) -> Self {
        Self {
            processor,
            queues,
            root,
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Sets the number of workers bound to `queue_name`, spawning or
    /// stopping workers as needed.
    pub(crate) fn scale(&self, queue_name: &str, count: usize) {
        let queue = self.queues.ensure(queue_name, QueueKind::Memory);
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = workers.entry(queue_name.to_string()).or_default();

        while entry.len() > count {
            if let Some(handle) = entry.pop() {
                handle.stop();
            }
        }
        while entry.len() < count {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entry.push(spawn_worker(
                id,
                Arc::clone(&queue),
                Arc::clone(&self.processor),
                &self.root,
            ));
        }
        tracing::info!(queue = queue_name, workers = count, "queue scaled");
    }

    /// Stops every worker bound to `queue_name`.
    pub(crate) fn pause(&self, queue_name: &str) {
        self.scale(queue_name, 0);
    }

    /// Restores `count` workers on `queue_name`.
    pub(crate) fn resume(&self, queue_name: &str, count: usize) {
        self.scale(queue_name, count);
    }

    /// Number of active workers bound to `queue_name`.
    pub(crate) fn active(&self, queue_name: &str) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_name)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Snapshots of every active worker.
    pub(crate) fn stats(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .map(|handle| handle.shared.snapshot())
            .collect()
    }

    /// Stops every worker in the pool.
    pub(crate) fn stop_all(&self) {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.values().flatten() {
            handle.stop();
        }
    }
}
