//! Job lifecycle events and their dispatcher.
//!
//! Each listener gets its own queue and consumer task: listeners observe
//! events in emission order, two listeners observe them concurrently, and a
//! slow listener never stalls the processing path.

use crate::job::Job;
use chrono::{DateTime, Utc};
use gatehouse_core::GatehouseEvent;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;

/// A job lifecycle event.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job was admitted to a queue.
    Queued { job: Job, timestamp: Instant },
    /// A worker began executing the job.
    Started { job: Job, timestamp: Instant },
    /// The handler finished successfully.
    Completed { job: Job, timestamp: Instant },
    /// The job failed with no attempts left.
    Failed { job: Job, timestamp: Instant },
    /// The job failed and was rescheduled.
    Retrying {
        job: Job,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        timestamp: Instant,
    },
    /// The job was cancelled externally.
    Cancelled { job: Job, timestamp: Instant },
    /// The job was routed to the dead-letter queue.
    DeadLetter { job: Job, timestamp: Instant },
}

impl JobEvent {
    /// The job the event concerns.
    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Queued { job, .. }
            | JobEvent::Started { job, .. }
            | JobEvent::Completed { job, .. }
            | JobEvent::Failed { job, .. }
            | JobEvent::Retrying { job, .. }
            | JobEvent::Cancelled { job, .. }
            | JobEvent::DeadLetter { job, .. } => job,
        }
    }
}

impl GatehouseEvent for JobEvent {
    fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "job.queued",
            JobEvent::Started { .. } => "job.started",
            JobEvent::Completed { .. } => "job.completed",
            JobEvent::Failed { .. } => "job.failed",
            JobEvent::Retrying { .. } => "job.retrying",
            JobEvent::Cancelled { .. } => "job.cancelled",
            JobEvent::DeadLetter { .. } => "job.dead_letter",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            JobEvent::Queued { timestamp, .. }
            | JobEvent::Started { timestamp, .. }
            | JobEvent::Completed { timestamp, .. }
            | JobEvent::Failed { timestamp, .. }
            | JobEvent::Retrying { timestamp, .. }
            | JobEvent::Cancelled { timestamp, .. }
            | JobEvent::DeadLetter { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        &self.job().queue
    }
}

/// Dispatches job events to listeners, each on its own consumer task.
#[derive(Clone, Default)]
pub(crate) struct JobEventBus {
    listeners: Arc<RwLock<Vec<mpsc::UnboundedSender<JobEvent>>>>,
}

impl JobEventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Must be called inside a tokio runtime.
    pub(crate) fn subscribe<F>(&self, f: F)
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    f(&event);
                }));
                if result.is_err() {
                    tracing::warn!(
                        event_type = event.event_type(),
                        "job event listener panicked"
                    );
                }
            }
        });
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
    }

    /// Emits an event without waiting for any listener.
    pub(crate) fn emit(&self, event: JobEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            // A closed channel means the listener task is gone; skip it.
            let _ = listener.send(event.clone());
        }
    }
}
