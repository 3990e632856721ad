//! The job entity and its status machine.

use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Dispatch priority. Higher priorities are dispatched first; ties are
/// broken by creation time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl Priority {
    /// The wire name of this priority.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl JobStatus {
    /// The wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Cancellation is reachable from any non-terminal state.
        if next == JobStatus::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Scheduled, JobStatus::Pending)
                | (JobStatus::Scheduled, JobStatus::Running)
                | (JobStatus::Retrying, JobStatus::Scheduled)
                | (JobStatus::Retrying, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Retrying)
        )
    }
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// 24 hex characters, random.
    pub id: String,
    /// Handler lookup key.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Queue the job is routed to.
    pub queue: String,
    pub priority: Priority,
    pub payload: Payload,
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Per-job override of the engine's retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Job {
    /// Creates a pending job of `job_type` with an empty payload, bound for
    /// the given queue.
    pub fn new(job_type: impl Into<String>, queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: gatehouse_core::job_id(),
            job_type: job_type.into(),
            queue: queue.into(),
            priority: Priority::Normal,
            payload: Payload::new(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: None,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            result: None,
            metadata: HashMap::new(),
        }
    }

    /// Starts a builder for a job of `job_type`.
    pub fn builder(job_type: impl Into<String>) -> JobBuilder {
        JobBuilder::new(job_type)
    }

    /// Whether the job may be dispatched now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Scheduled)
            && self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.touch();
    }

    pub(crate) fn mark_completed(&mut self, result: Option<Value>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = result;
        self.touch();
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.touch();
    }

    pub(crate) fn mark_retrying(&mut self, next_attempt_at: DateTime<Utc>, error: impl Into<String>) {
        // Retrying is transitional; the job lands back in the queue as
        // scheduled for its next attempt.
        self.status = JobStatus::Retrying;
        self.error = Some(error.into());
        self.status = JobStatus::Scheduled;
        self.scheduled_at = Some(next_attempt_at);
        self.touch();
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.touch();
    }
}

/// Fluent constructor for [`Job`].
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    fn new(job_type: impl Into<String>) -> Self {
        Self {
            job: Job::new(job_type, ""),
        }
    }

    /// Target queue. Defaults to the manager's default queue when empty.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.job.queue = queue.into();
        self
    }

    /// Dispatch priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.job.priority = priority;
        self
    }

    /// Adds one payload entry.
    pub fn payload_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.job.payload.set(key, value);
        self
    }

    /// Replaces the whole payload.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.job.payload = payload;
        self
    }

    /// Per-job retry budget override.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.job.max_attempts = Some(max);
        self
    }

    /// Earliest dispatch time.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.scheduled_at = Some(at);
        self.job.status = JobStatus::Scheduled;
        self
    }

    /// Adds one metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.job.metadata.insert(key.into(), value.into());
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> Job {
        self.job
    }
}
