//! In-process background job engine.
//!
//! Application code submits [`Job`]s to a [`JobManager`], which routes them
//! to named queues. Long-lived workers pop ready jobs in
//! `(priority desc, enqueue order)` and execute them through registered
//! handlers under per-job timeouts. Failures retry with exponential backoff
//! and jitter until the attempt budget runs out, then land in the
//! `dead_letter` queue. Every lifecycle step is observable through typed
//! events delivered to concurrent listeners.
//!
//! # Queues
//!
//! - `memory` / `priority`: ordered by `(priority desc, created_at asc)`.
//! - `delayed`: every push is stamped `scheduled_at = now` and marked
//!   scheduled; a background sweep promotes due jobs.
//! - `dead_letter`: terminal parking for jobs with exhausted retries.
//!
//! # Example
//!
//! ```
//! use gatehouse_jobs::{Job, JobManager, Priority};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = JobManager::builder()
//!     .default_workers(2)
//!     .on_dead_letter(|job| {
//!         eprintln!("buried {} after {} attempts", job.id, job.attempts);
//!     })
//!     .build()?;
//!
//! manager.register_handler_fn("report", |ctx, job| async move {
//!     tokio::select! {
//!         _ = ctx.cancel.cancelled() => Err(gatehouse_jobs::JobError::handler("cancelled")),
//!         _ = tokio::time::sleep(Duration::from_millis(10)) => {
//!             Ok(serde_json::json!({"rows": 42}))
//!         }
//!     }
//! });
//!
//! manager.enqueue(Job::builder("report").priority(Priority::High).build())?;
//! # manager.stop().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod events;
mod job;
mod manager;
mod payload;
#[cfg(feature = "persistence")]
mod persistence;
mod processor;
mod queue;
mod retry;
mod scheduler;
mod worker;

pub use error::JobError;
pub use events::JobEvent;
pub use job::{Job, JobBuilder, JobStatus, Priority};
pub use manager::{JobManager, JobManagerBuilder, ManagerStats};
pub use payload::{parse_duration, Payload, PayloadError};
#[cfg(feature = "persistence")]
pub use persistence::PersistenceOptions;
pub use processor::{handler_fn, HandlerRegistry, JobContext, JobHandler};
pub use queue::{JobQueue, QueueKind, DEAD_LETTER_QUEUE};
pub use retry::RetryConfig;
pub use scheduler::{CronEntryId, CronSpec};
pub use worker::{WorkerSnapshot, WorkerStatus};
