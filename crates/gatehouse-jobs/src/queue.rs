//! Named in-memory job queues with ordered admission.
//!
//! Jobs are totally ordered by `(priority desc, created_at asc, admission
//! seq)`. The ordered map plus an id index give O(log n) removal by job id.

use crate::error::JobError;
use crate::job::{Job, JobStatus, Priority};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Admission semantics of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Plain ordered queue.
    Memory,
    /// Identical ordering; distinct tag for queues meant to carry
    /// prioritized work.
    Priority,
    /// Every push is stamped `scheduled_at = now` and marked scheduled.
    Delayed,
}

/// Name of the queue that receives jobs with exhausted retries.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Poll interval of a blocked [`JobQueue::pop`].
pub(crate) const POP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<Priority>,
    created_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct QueueInner {
    ordered: BTreeMap<OrderKey, Job>,
    index: HashMap<String, OrderKey>,
    seq: u64,
}

/// One named queue.
pub struct JobQueue {
    name: String,
    kind: QueueKind,
    capacity: Option<usize>,
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    /// Creates an empty queue.
    pub fn new(name: impl Into<String>, kind: QueueKind, capacity: Option<usize>) -> Self {
        Self {
            name: name.into(),
            kind,
            capacity,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue's admission semantics.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Admits a job.
    pub fn push(&self, mut job: Job) -> Result<(), JobError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(capacity) = self.capacity {
            if inner.ordered.len() >= capacity {
                return Err(JobError::QueueFull {
                    queue: self.name.clone(),
                });
            }
        }

        if self.kind == QueueKind::Delayed {
            if job.scheduled_at.is_none() {
                job.scheduled_at = Some(Utc::now());
            }
            job.status = JobStatus::Scheduled;
        }

        inner.seq += 1;
        let key = OrderKey {
            priority: Reverse(job.priority),
            created_at: job.created_at,
            seq: inner.seq,
        };
        inner.index.insert(job.id.clone(), key);
        inner.ordered.insert(key, job);
        Ok(())
    }

    /// Removes and returns the highest-priority ready job, if any.
    pub fn try_pop(&self) -> Option<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let key = inner
            .ordered
            .iter()
            .find(|(_, job)| job.is_ready(now))
            .map(|(key, _)| *key)?;
        let job = inner.ordered.remove(&key)?;
        inner.index.remove(&job.id);
        Some(job)
    }

    /// A clone of the next ready job without removing it.
    pub fn peek(&self) -> Option<Job> {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .ordered
            .values()
            .find(|job| job.is_ready(now))
            .cloned()
    }

    /// Waits for a ready job, polling every 100ms, until `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Job> {
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(POP_POLL_INTERVAL) => {}
            }
        }
    }

    /// Removes a job by id.
    pub fn remove(&self, id: &str) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = inner.index.remove(id)?;
        inner.ordered.remove(&key)
    }

    /// A clone of the job with the given id.
    pub fn get(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = inner.index.get(id)?;
        inner.ordered.get(key).cloned()
    }

    /// Number of queued jobs (ready or not).
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ordered
            .len()
    }

    /// Whether the queue holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones of every queued job, in dispatch order.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ordered
            .values()
            .cloned()
            .collect()
    }

    /// Promotes due scheduled jobs to pending. Returns how many moved.
    pub fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut promoted = 0;
        for job in inner.ordered.values_mut() {
            if job.status == JobStatus::Scheduled
                && job.scheduled_at.map_or(true, |at| at <= now)
            {
                job.status = JobStatus::Pending;
                job.touch();
                promoted += 1;
            }
        }
        promoted
    }
}

/// The manager's registry of named queues.
pub(crate) struct QueueSet {
    queues: std::sync::RwLock<HashMap<String, std::sync::Arc<JobQueue>>>,
    max_size: Option<usize>,
}

impl QueueSet {
    pub(crate) fn new(max_size: Option<usize>) -> Self {
        let set = Self {
            queues: std::sync::RwLock::new(HashMap::new()),
            max_size,
        };
        // The dead-letter queue exists by convention.
        set.ensure(DEAD_LETTER_QUEUE, QueueKind::Memory);
        set
    }

    /// Returns the named queue, creating it with the given kind if absent.
    pub(crate) fn ensure(&self, name: &str, kind: QueueKind) -> std::sync::Arc<JobQueue> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return std::sync::Arc::clone(queue);
        }
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        std::sync::Arc::clone(queues.entry(name.to_string()).or_insert_with(|| {
            // The dead-letter queue is unbounded so terminal jobs are never
            // dropped for capacity.
            let capacity = (name != DEAD_LETTER_QUEUE).then_some(self.max_size).flatten();
            std::sync::Arc::new(JobQueue::new(name, kind, capacity))
        }))
    }

    pub(crate) fn get(&self, name: &str) -> Option<std::sync::Arc<JobQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(std::sync::Arc::clone)
    }

    pub(crate) fn all(&self) -> Vec<std::sync::Arc<JobQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(std::sync::Arc::clone)
            .collect()
    }
}
