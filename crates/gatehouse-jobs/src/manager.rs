//! The public façade of the job engine.

use crate::error::JobError;
use crate::events::{JobEvent, JobEventBus};
use crate::job::{Job, JobStatus};
use crate::processor::{
    handler_fn, EngineCounters, HandlerRegistry, JobContext, JobHandler, Processor,
    DEFAULT_JOB_TIMEOUT,
};
use crate::queue::{JobQueue, QueueKind, QueueSet};
use crate::retry::RetryConfig;
use crate::scheduler::{CronEntryId, CronScheduler, CronSpec};
use crate::worker::{WorkerPool, WorkerSnapshot};
use chrono::Utc;
use gatehouse_core::ConfigError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use metrics::counter;

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    /// Current depth of every known queue.
    pub queue_depths: HashMap<String, usize>,
}

type BoxedJobListener = Box<dyn Fn(&JobEvent) + Send + Sync + 'static>;

/// Builder for [`JobManager`].
pub struct JobManagerBuilder {
    default_queue: String,
    default_workers: usize,
    max_queue_size: Option<usize>,
    poll_interval: Duration,
    default_timeout: Duration,
    retry: RetryConfig,
    listeners: Vec<BoxedJobListener>,
    #[cfg(feature = "persistence")]
    persistence: Option<crate::persistence::PersistenceOptions>,
}

impl Default for JobManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManagerBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - default queue `"default"` with 5 workers
    /// - unbounded queues
    /// - scheduled-job sweep every 30 seconds
    /// - per-job timeout 30 minutes
    /// - retry: 3 attempts, 1s base delay doubling, jitter on
    pub fn new() -> Self {
        Self {
            default_queue: "default".to_string(),
            default_workers: 5,
            max_queue_size: None,
            poll_interval: Duration::from_secs(30),
            default_timeout: DEFAULT_JOB_TIMEOUT,
            retry: RetryConfig::default(),
            listeners: Vec::new(),
            #[cfg(feature = "persistence")]
            persistence: None,
        }
    }

    /// Name of the queue jobs land on when they do not pick one.
    pub fn default_queue<S: Into<String>>(mut self, name: S) -> Self {
        self.default_queue = name.into();
        self
    }

    /// Workers started on the default queue.
    pub fn default_workers(mut self, count: usize) -> Self {
        self.default_workers = count;
        self
    }

    /// Bounds every queue (except dead-letter). Enqueues beyond the bound
    /// fail with `queue full`.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Interval of the sweep that promotes due scheduled jobs.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Per-job timeout applied when the payload carries none.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Retry policy for failed handlers.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Registers a listener for every lifecycle event.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(f));
        self
    }

    /// Registers a callback for completed jobs.
    pub fn on_completed<F>(self, f: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let JobEvent::Completed { job, .. } = event {
                f(job);
            }
        })
    }

    /// Registers a callback for terminally failed jobs.
    pub fn on_failed<F>(self, f: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let JobEvent::Failed { job, .. } = event {
                f(job);
            }
        })
    }

    /// Registers a callback for jobs entering the dead-letter queue.
    pub fn on_dead_letter<F>(self, f: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let JobEvent::DeadLetter { job, .. } = event {
                f(job);
            }
        })
    }

    /// Enables best-effort snapshot persistence.
    #[cfg(feature = "persistence")]
    pub fn persistence(mut self, options: crate::persistence::PersistenceOptions) -> Self {
        self.persistence = Some(options);
        self
    }

    /// Builds and starts the manager: default-queue workers, the
    /// scheduled-job sweep, and (when enabled) the persistence task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<JobManager, ConfigError> {
        self.retry.validate()?;
        if self.default_queue.is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_queue",
                reason: "must not be empty".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "poll_interval",
            });
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "default_timeout",
            });
        }

        let root = CancellationToken::new();
        let queues = Arc::new(QueueSet::new(self.max_queue_size));
        queues.ensure(&self.default_queue, QueueKind::Memory);

        let events = JobEventBus::new();
        for listener in self.listeners {
            events.subscribe(move |event| listener(event));
        }

        let processor = Arc::new(Processor {
            registry: Arc::new(HandlerRegistry::new()),
            retry: self.retry,
            default_timeout: self.default_timeout,
            events: events.clone(),
            queues: Arc::clone(&queues),
            counters: Arc::new(EngineCounters::default()),
            finished: Mutex::new(HashMap::new()),
        });

        let pool = WorkerPool::new(Arc::clone(&processor), Arc::clone(&queues), root.clone());
        pool.scale(&self.default_queue, self.default_workers);

        let inner = Arc::new(ManagerInner {
            default_queue: self.default_queue,
            queues,
            events,
            processor,
            pool,
            cron: CronScheduler::new(),
            root: root.clone(),
            #[cfg(feature = "persistence")]
            snapshotter: self.persistence.map(crate::persistence::Snapshotter::new),
        });

        // Scheduled-job sweep: promote due jobs so they become ready.
        {
            let sweep = Arc::downgrade(&inner);
            let token = root.clone();
            let interval = self.poll_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = sweep.upgrade() else { break };
                            let now = Utc::now();
                            let mut promoted = 0;
                            for queue in inner.queues.all() {
                                promoted += queue.promote_due(now);
                            }
                            if promoted > 0 {
                                tracing::debug!(promoted, "promoted due scheduled jobs");
                            }
                        }
                    }
                }
            });
        }

        #[cfg(feature = "persistence")]
        if let Some(snapshotter) = &inner.snapshotter {
            snapshotter.spawn(Arc::downgrade(&inner), root.clone());
        }

        Ok(JobManager { inner })
    }
}

pub(crate) struct ManagerInner {
    default_queue: String,
    pub(crate) queues: Arc<QueueSet>,
    events: JobEventBus,
    pub(crate) processor: Arc<Processor>,
    pool: WorkerPool,
    cron: CronScheduler,
    root: CancellationToken,
    #[cfg(feature = "persistence")]
    pub(crate) snapshotter: Option<crate::persistence::Snapshotter>,
}

impl ManagerInner {
    fn enqueue(&self, mut job: Job) -> Result<String, JobError> {
        if job.queue.is_empty() {
            job.queue = self.default_queue.clone();
        }
        let queue = self.queues.ensure(&job.queue, QueueKind::Memory);
        let id = job.id.clone();

        self.processor
            .counters
            .queued
            .fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("gatehouse_jobs_queued_total", "queue" => job.queue.clone()).increment(1);

        // Emitted before the push so no listener can observe job.started
        // ahead of job.queued. A failed push leaves "queued" as the whole
        // (still valid) event sequence.
        self.events.emit(JobEvent::Queued {
            job: job.clone(),
            timestamp: Instant::now(),
        });
        queue.push(job)?;
        Ok(id)
    }

    pub(crate) fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .queues
            .all()
            .iter()
            .flat_map(|queue| queue.jobs())
            .collect();
        jobs.extend(self.processor.finished_jobs());
        jobs
    }
}

/// The job engine façade: enqueue, schedule, observe, scale.
///
/// ```
/// use gatehouse_jobs::{Job, JobManager, Priority};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = JobManager::builder().default_workers(2).build()?;
///
/// manager.register_handler_fn("email", |_ctx, job| async move {
///     let to = job.payload.get_str("to").map_err(|e| {
///         gatehouse_jobs::JobError::handler(e.to_string())
///     })?;
///     Ok(serde_json::json!({ "delivered_to": to }))
/// });
///
/// let id = manager.enqueue(
///     Job::builder("email")
///         .priority(Priority::High)
///         .payload_entry("to", "alice@example.com")
///         .build(),
/// )?;
/// # let _ = id;
/// # manager.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    /// Creates a new builder.
    pub fn builder() -> JobManagerBuilder {
        JobManagerBuilder::new()
    }

    /// Registers a handler for `job_type`.
    pub fn register_handler<H: JobHandler>(&self, job_type: &str, handler: H) {
        self.inner
            .processor
            .registry
            .register(job_type, Arc::new(handler));
    }

    /// Registers an async closure as the handler for `job_type`.
    pub fn register_handler_fn<F, Fut>(&self, job_type: &str, f: F)
    where
        F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.register_handler(job_type, handler_fn(f));
    }

    /// Enqueues a job onto its queue (or the default queue) and emits
    /// `job.queued`. Fails with `queue full` at the configured bound.
    pub fn enqueue(&self, job: Job) -> Result<String, JobError> {
        self.inner.enqueue(job)
    }

    /// Enqueues a job to run no earlier than `delay` from now.
    pub fn enqueue_in(&self, mut job: Job, delay: Duration) -> Result<String, JobError> {
        job.scheduled_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
        job.status = JobStatus::Scheduled;
        self.inner.enqueue(job)
    }

    /// Registers a cron entry (seconds-precision expression). Each firing
    /// enqueues a fresh job built from `spec` at the default priority.
    pub fn schedule_cron(&self, expr: &str, spec: CronSpec) -> Result<CronEntryId, ConfigError> {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .cron
            .schedule(expr, spec, &self.inner.root, move |job| {
                if let Some(inner) = weak.upgrade() {
                    if let Err(err) = inner.enqueue(job) {
                        tracing::warn!(%err, "cron firing dropped");
                    }
                }
            })
    }

    /// Stops further firings of a cron entry. Jobs already enqueued by past
    /// firings are not recalled.
    pub fn unschedule_cron(&self, id: CronEntryId) -> bool {
        self.inner.cron.unschedule(id)
    }

    /// The registered cron entries.
    pub fn cron_entries(&self) -> Vec<(CronEntryId, String)> {
        self.inner.cron.entries()
    }

    /// Cancels a queued or scheduled job. Running jobs finish their current
    /// attempt; terminal jobs cannot be cancelled.
    pub fn cancel_job(&self, id: &str) -> Result<Job, JobError> {
        for queue in self.inner.queues.all() {
            let Some(parked) = queue.get(id) else { continue };
            if parked.status.is_terminal() {
                // Dead-lettered jobs stay where they are.
                return Err(JobError::Terminal(id.to_string()));
            }
            if let Some(mut job) = queue.remove(id) {
                job.mark_cancelled();
                self.inner
                    .processor
                    .counters
                    .cancelled
                    .fetch_add(1, Ordering::Relaxed);
                self.inner.events.emit(JobEvent::Cancelled {
                    job: job.clone(),
                    timestamp: Instant::now(),
                });
                self.inner
                    .processor
                    .finished
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(job.id.clone(), job.clone());
                return Ok(job);
            }
        }
        if self.inner.processor.finished_job(id).is_some() {
            return Err(JobError::Terminal(id.to_string()));
        }
        Err(JobError::NotFound(id.to_string()))
    }

    /// A clone of the job with the given id, wherever it lives.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        for queue in self.inner.queues.all() {
            if let Some(job) = queue.get(id) {
                return Some(job);
            }
        }
        self.inner.processor.finished_job(id)
    }

    /// Every known job, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs = self.inner.all_jobs();
        if let Some(status) = status {
            jobs.retain(|job| job.status == status);
        }
        jobs
    }

    /// Creates (or returns) a queue with the given admission semantics.
    pub fn ensure_queue(&self, name: &str, kind: QueueKind) -> Arc<JobQueue> {
        self.inner.queues.ensure(name, kind)
    }

    /// Sets the number of workers bound to a queue.
    pub fn scale_queue(&self, name: &str, workers: usize) {
        self.inner.pool.scale(name, workers);
    }

    /// Stops all workers on a queue. Queued jobs wait until resume.
    pub fn pause_queue(&self, name: &str) {
        self.inner.pool.pause(name);
    }

    /// Restores `workers` workers on a paused queue.
    pub fn resume_queue(&self, name: &str, workers: usize) {
        self.inner.pool.resume(name, workers);
    }

    /// Number of active workers on a queue.
    pub fn active_workers(&self, name: &str) -> usize {
        self.inner.pool.active(name)
    }

    /// Snapshots of every active worker.
    pub fn worker_stats(&self) -> Vec<WorkerSnapshot> {
        self.inner.pool.stats()
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> ManagerStats {
        let counters = &self.inner.processor.counters;
        ManagerStats {
            queued: counters.queued.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            queue_depths: self
                .inner
                .queues
                .all()
                .iter()
                .map(|queue| (queue.name().to_string(), queue.len()))
                .collect(),
        }
    }

    /// Registers a listener for every lifecycle event.
    pub fn on_event<F>(&self, f: F)
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(f);
    }

    /// Stops the engine: cancels the root context so workers drain, stops
    /// cron firings, and (when enabled) takes a final snapshot. Idempotent.
    pub async fn stop(&self) {
        self.inner.root.cancel();
        self.inner.cron.stop_all();
        self.inner.pool.stop_all();

        #[cfg(feature = "persistence")]
        if let Some(snapshotter) = &self.inner.snapshotter {
            snapshotter.flush(&self.inner.all_jobs()).await;
        }

        tracing::info!("job manager stopped");
    }
}
