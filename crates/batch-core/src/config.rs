//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BatchError, Result};
use crate::policy::{LimitCheckingSkipPolicy, SimpleRetryPolicy};

/// Default number of items read per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Default number of malformed records a step tolerates.
pub const DEFAULT_SKIP_LIMIT: u64 = 10;

/// Default number of attempts per record for transient failures.
pub const DEFAULT_RETRY_LIMIT: u32 = 100;

/// Default database URL for the execution ledger.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://batch.db";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default time to wait on a locked database, in seconds.
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

/// Default age after which a `started` execution without progress is
/// considered abandoned, in seconds.
pub const DEFAULT_STALE_EXECUTION_SECS: i64 = 600;

/// Chunking and fault tolerance settings for chunk-oriented steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub skip_limit: u64,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_limit: DEFAULT_SKIP_LIMIT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_backoff_ms: 0,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(BatchError::illegal_state("chunk_size must be greater than 0"));
        }
        if self.retry_limit == 0 {
            return Err(BatchError::illegal_state(
                "retry_limit must allow at least one attempt",
            ));
        }
        Ok(())
    }

    pub fn skip_policy(&self) -> LimitCheckingSkipPolicy {
        LimitCheckingSkipPolicy::new(self.skip_limit)
    }

    pub fn retry_policy(&self) -> SimpleRetryPolicy {
        SimpleRetryPolicy::new(self.retry_limit)
            .with_backoff(Duration::from_millis(self.retry_backoff_ms))
    }
}

/// Execution ledger connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
    pub stale_execution_secs: i64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            busy_timeout_secs: DEFAULT_BUSY_TIMEOUT_SECS,
            stale_execution_secs: DEFAULT_STALE_EXECUTION_SECS,
        }
    }
}

impl RepositoryConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(BatchError::illegal_state("database URL cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(BatchError::illegal_state(
                "max_connections must be greater than 0",
            ));
        }
        if self.stale_execution_secs < 0 {
            return Err(BatchError::illegal_state(
                "stale_execution_secs cannot be negative",
            ));
        }
        self.stale_after()?;
        Ok(())
    }

    /// The stale-execution window as a duration
    pub fn stale_after(&self) -> Result<chrono::TimeDelta> {
        chrono::TimeDelta::try_seconds(self.stale_execution_secs).ok_or_else(|| {
            BatchError::illegal_state(format!(
                "stale_execution_secs is out of range: {}",
                self.stale_execution_secs
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BatchConfig::default().validate().is_ok());
        assert!(RepositoryConfig::default().validate().is_ok());
        assert_eq!(BatchConfig::default().chunk_size, 100);
        assert_eq!(BatchConfig::default().skip_limit, 10);
        assert_eq!(BatchConfig::default().retry_limit, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = BatchConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let repo = RepositoryConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(repo.validate().is_err());
    }

    #[test]
    fn test_stale_window_out_of_range_rejected() {
        let repo = RepositoryConfig {
            stale_execution_secs: i64::MAX,
            ..Default::default()
        };
        assert!(matches!(repo.validate(), Err(BatchError::IllegalState(_))));
        assert!(repo.stale_after().is_err());

        let repo = RepositoryConfig {
            stale_execution_secs: 90,
            ..Default::default()
        };
        assert_eq!(repo.stale_after().ok(), chrono::TimeDelta::try_seconds(90));
    }
}
