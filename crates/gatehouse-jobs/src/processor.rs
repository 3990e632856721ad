//! Job execution: handler dispatch, per-job timeouts, retries, dead-letter
//! routing.

use crate::error::JobError;
use crate::events::{JobEvent, JobEventBus};
use crate::job::Job;
use crate::queue::{QueueSet, DEAD_LETTER_QUEUE, QueueKind};
use crate::retry::RetryConfig;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

/// Execution context handed to a handler.
///
/// Handlers must observe `cancel` at their suspension points: it fires when
/// the per-job timeout expires or the engine shuts down.
#[derive(Clone)]
pub struct JobContext {
    /// Cooperative cancellation for this execution.
    pub cancel: CancellationToken,
}

/// A caller-registered capability that executes one job type.
pub trait JobHandler: Send + Sync + 'static {
    /// Executes the job, returning its result value.
    fn handle(&self, ctx: JobContext, job: Job) -> BoxFuture<'static, Result<Value, JobError>>;
}

struct FnHandler<F>(F);

impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    fn handle(&self, ctx: JobContext, job: Job) -> BoxFuture<'static, Result<Value, JobError>> {
        Box::pin((self.0)(ctx, job))
    }
}

/// Wraps an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl JobHandler
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    FnHandler(f)
}

/// Handler lookup by job type. Reads take shared access on the processing
/// path; registration takes exclusive access.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_type.to_string(), handler);
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_type)
            .map(Arc::clone)
    }
}

/// Aggregate counters maintained by the engine.
#[derive(Default)]
pub(crate) struct EngineCounters {
    pub(crate) queued: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

/// What became of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    Completed,
    Retried,
    Failed,
}

/// Default per-job timeout when the payload does not carry one.
pub(crate) const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub(crate) struct Processor {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) retry: RetryConfig,
    pub(crate) default_timeout: Duration,
    pub(crate) events: JobEventBus,
    pub(crate) queues: Arc<QueueSet>,
    pub(crate) counters: Arc<EngineCounters>,
    /// Terminal jobs that are not parked in a queue (completed ones).
    pub(crate) finished: Mutex<HashMap<String, Job>>,
}

impl Processor {
    /// Executes one popped job to an outcome.
    pub(crate) async fn process(&self, mut job: Job, cancel: &CancellationToken) -> ProcessOutcome {
        let origin_queue = job.queue.clone();
        job.mark_running();
        self.events.emit(JobEvent::Started {
            job: job.clone(),
            timestamp: Instant::now(),
        });

        tracing::debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %origin_queue,
            attempt = job.attempts + 1,
            "job started"
        );

        let Some(handler) = self.registry.get(&job.job_type) else {
            let error = JobError::NoHandler {
                job_type: job.job_type.clone(),
            };
            return self.fail_terminally(job, error.to_string());
        };

        let timeout = job.payload.timeout().unwrap_or(self.default_timeout);
        let ctx = JobContext {
            cancel: cancel.child_token(),
        };
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, handler.handle(ctx.clone(), job.clone()))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                // Tell the handler to stop; it observes the child token.
                ctx.cancel.cancel();
                Err(JobError::Timeout(timeout))
            }
        };

        #[cfg(feature = "metrics")]
        histogram!("gatehouse_jobs_duration_seconds", "queue" => origin_queue.clone())
            .record(started.elapsed().as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = started;

        match result {
            Ok(value) => {
                job.mark_completed(Some(value));
                self.counters.completed.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "metrics")]
                counter!("gatehouse_jobs_completed_total", "queue" => origin_queue.clone())
                    .increment(1);

                tracing::debug!(job_id = %job.id, "job completed");
                self.events.emit(JobEvent::Completed {
                    job: job.clone(),
                    timestamp: Instant::now(),
                });
                self.remember(job);
                ProcessOutcome::Completed
            }
            Err(error) => self.retry_or_bury(job, &origin_queue, error),
        }
    }

    fn retry_or_bury(&self, mut job: Job, origin_queue: &str, error: JobError) -> ProcessOutcome {
        let max_attempts = job.max_attempts.unwrap_or(self.retry.max_attempts);
        job.attempts += 1;

        if job.attempts < max_attempts {
            let delay = self.retry.delay_for(job.attempts);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            job.mark_retrying(next_retry_at, error.to_string());
            self.counters.retried.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "metrics")]
            counter!("gatehouse_jobs_retried_total", "queue" => origin_queue.to_string())
                .increment(1);

            tracing::info!(
                job_id = %job.id,
                attempt = job.attempts,
                delay_ms = delay.as_millis(),
                "job failed, retrying"
            );
            self.events.emit(JobEvent::Retrying {
                job: job.clone(),
                attempt: job.attempts,
                next_retry_at,
                timestamp: Instant::now(),
            });

            let queue = self
                .queues
                .ensure(origin_queue, QueueKind::Memory);
            if let Err(err) = queue.push(job.clone()) {
                // The queue filled while the job was running; bury it so
                // the failure is not silently lost.
                tracing::warn!(job_id = %job.id, %err, "re-push failed, burying job");
                return self.fail_terminally(job, err.to_string());
            }
            ProcessOutcome::Retried
        } else {
            self.fail_terminally(job, error.to_string())
        }
    }

    fn fail_terminally(&self, mut job: Job, error: String) -> ProcessOutcome {
        job.mark_failed(error);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("gatehouse_jobs_failed_total", "queue" => job.queue.clone()).increment(1);

        tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            error = job.error.as_deref().unwrap_or_default(),
            "job failed terminally"
        );
        self.events.emit(JobEvent::Failed {
            job: job.clone(),
            timestamp: Instant::now(),
        });

        let dead_letter = self.queues.ensure(DEAD_LETTER_QUEUE, QueueKind::Memory);
        match dead_letter.push(job.clone()) {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.events.emit(JobEvent::DeadLetter {
                    job,
                    timestamp: Instant::now(),
                });
            }
            Err(err) => {
                tracing::error!(job_id = %job.id, %err, "dead-letter push failed");
                self.remember(job);
            }
        }
        ProcessOutcome::Failed
    }

    fn remember(&self, job: Job) {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job);
    }

    /// Looks up a terminal job kept outside the queues.
    pub(crate) fn finished_job(&self, id: &str) -> Option<Job> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Clones of every remembered terminal job.
    pub(crate) fn finished_jobs(&self) -> Vec<Job> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
