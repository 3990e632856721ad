//! Configuration error type shared by the gatehouse builders.
//!
//! Every builder validates at `build()` time; a process must not start with
//! invalid protection or job-engine configuration.

/// An invalid configuration value, reported at construction time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A numeric field that must be strictly positive was zero or negative.
    #[error("{field} must be positive")]
    NonPositive {
        /// Name of the offending field.
        field: &'static str,
    },
    /// A field fell below its required minimum.
    #[error("{field} must be at least {min}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// The required minimum.
        min: u64,
    },
    /// A cron expression failed to parse.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        /// The rejected expression.
        expr: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// Any other invalid value.
    #[error("{field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
