//! Error types for the batch engine
//!
//! The variants double as the engine's failure taxonomy: skip policies look
//! for [`BatchError::MalformedInput`], retry policies for
//! [`BatchError::Transient`], and everything else aborts the current chunk.

use thiserror::Error;

/// Result type alias for batch operations
pub type Result<T> = std::result::Result<T, BatchError>;

#[derive(Error, Debug)]
pub enum BatchError {
    /// A source record could not be parsed; eligible for skipping
    #[error("Malformed input at line {line_number}: {reason}")]
    MalformedInput {
        line_number: u64,
        raw: String,
        reason: String,
    },

    /// A processing failure that may succeed when attempted again
    #[error("Transient processing failure: {0}")]
    Transient(String),

    /// A processing failure that will not go away on retry
    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("Job '{job_name}' already completed for these parameters (instance {instance_id}). Re-run with force to execute it again.")]
    AlreadyComplete { job_name: String, instance_id: i64 },

    #[error("Job '{job_name}' is already running for these parameters (execution {execution_id})")]
    AlreadyRunning { job_name: String, execution_id: i64 },

    #[error("Skip limit of {limit} exceeded: {source}")]
    SkipLimitExceeded {
        limit: u64,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Retry limit exhausted after {attempts} attempts: {source}")]
    RetryLimitExceeded {
        attempts: u32,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl BatchError {
    pub fn malformed(line_number: u64, raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            line_number,
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
