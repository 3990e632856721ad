//! Job engine error types.

use std::time::Duration;

/// Errors surfaced by the job engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The target queue is at its configured capacity.
    #[error("queue full")]
    QueueFull {
        /// Name of the saturated queue.
        queue: String,
    },
    /// No handler is registered for the job's type.
    #[error("no handler registered for job type {job_type:?}")]
    NoHandler {
        /// The unhandled job type.
        job_type: String,
    },
    /// The handler returned an error.
    #[error("{0}")]
    Handler(String),
    /// The handler did not finish within the per-job timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    /// No job with the given identifier is known.
    #[error("job not found: {0}")]
    NotFound(String),
    /// The job already reached a terminal state.
    #[error("job {0} is in a terminal state")]
    Terminal(String),
}

impl JobError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_the_wire_contract() {
        let err = JobError::QueueFull {
            queue: "emails".to_string(),
        };
        assert_eq!(err.to_string(), "queue full");

        let err = JobError::NoHandler {
            job_type: "email".to_string(),
        };
        assert!(err.to_string().contains("email"));
    }
}
