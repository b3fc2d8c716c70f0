//! Core types for the batch engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use crate::error::{BatchError, Result};
use crate::parameters::JobParameters;

/// Restart state shared between a step and its readers, writers and listeners.
pub type ExecutionContext = serde_json::Map<String, serde_json::Value>;

/// Status of a job or step execution (maps to the `status` columns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    NotStarted,
    Started,
    Completed,
    Failed,
    Stopped,
    /// Left `Started` by a process that died; reclaimed on the next launch
    Abandoned,
}

impl BatchStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BatchStatus::NotStarted => "not_started",
            BatchStatus::Started => "started",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Stopped => "stopped",
            BatchStatus::Abandoned => "abandoned",
        }
    }

    /// Whether a new launch may pick up where this execution left off
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Stopped | BatchStatus::Abandoned
        )
    }
}

impl TryFrom<String> for BatchStatus {
    type Error = BatchError;

    fn try_from(s: String) -> Result<Self> {
        match s.as_str() {
            "not_started" => Ok(BatchStatus::NotStarted),
            "started" => Ok(BatchStatus::Started),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "stopped" => Ok(BatchStatus::Stopped),
            "abandoned" => Ok(BatchStatus::Abandoned),
            other => Err(BatchError::illegal_state(format!(
                "unknown execution status '{other}' in the ledger"
            ))),
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// Terminal outcome of a job as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => f.write_str("COMPLETED"),
            JobStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// Item counters of a step execution.
///
/// `read_count` includes records that were read but rejected as malformed,
/// so a completed step satisfies
/// `write_count == read_count - read_skip_count - filter_count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub retry_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
}

impl AddAssign for StepCounters {
    fn add_assign(&mut self, other: Self) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.filter_count += other.filter_count;
        self.read_skip_count += other.read_skip_count;
        self.retry_count += other.retry_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
    }
}

/// One launch of a job instance (maps to batch_job_execution)
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: i64,
    pub job_instance_id: i64,
    pub job_name: String,
    pub status: BatchStatus,
    pub parameters: JobParameters,
    /// True when this launch continues a failed, stopped or abandoned run
    pub resumed: bool,
    pub exit_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// One run of a step within a job execution (maps to batch_step_execution)
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub id: i64,
    pub job_execution_id: i64,
    pub step_name: String,
    pub status: BatchStatus,
    pub counters: StepCounters,
    /// Number of source items consumed by committed chunks
    pub offset: u64,
    pub context: ExecutionContext,
    pub exit_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Where an interrupted run will continue
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPoint {
    pub job_execution_id: i64,
    pub step_name: String,
    pub status: BatchStatus,
    pub offset: u64,
    pub counters: StepCounters,
}

/// Outcome of one step within a job run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: BatchStatus,
    pub counters: StepCounters,
    pub exit_message: Option<String>,
}

impl From<&StepExecution> for StepResult {
    fn from(execution: &StepExecution) -> Self {
        Self {
            step_name: execution.step_name.clone(),
            status: execution.status,
            counters: execution.counters,
            exit_message: execution.exit_message.clone(),
        }
    }
}

/// Outcome of a job run
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_execution_id: i64,
    pub job_name: String,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    pub exit_message: Option<String>,
}

impl JobResult {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [
            BatchStatus::NotStarted,
            BatchStatus::Started,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Stopped,
            BatchStatus::Abandoned,
        ] {
            assert_eq!(BatchStatus::try_from(status.as_str().to_string()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_text_is_rejected() {
        assert!(matches!(
            BatchStatus::try_from("running".to_string()),
            Err(BatchError::IllegalState(_))
        ));
    }

    #[test]
    fn test_restartable_statuses() {
        assert!(BatchStatus::Failed.is_restartable());
        assert!(BatchStatus::Stopped.is_restartable());
        assert!(BatchStatus::Abandoned.is_restartable());
        assert!(!BatchStatus::Completed.is_restartable());
        assert!(!BatchStatus::Started.is_restartable());
    }

    #[test]
    fn test_counters_accumulate() {
        let mut total = StepCounters {
            read_count: 100,
            write_count: 98,
            read_skip_count: 2,
            commit_count: 1,
            ..Default::default()
        };
        total += StepCounters {
            read_count: 50,
            write_count: 45,
            filter_count: 5,
            retry_count: 3,
            commit_count: 1,
            ..Default::default()
        };
        assert_eq!(total.read_count, 150);
        assert_eq!(total.write_count, 143);
        assert_eq!(total.filter_count, 5);
        assert_eq!(total.retry_count, 3);
        assert_eq!(total.commit_count, 2);
        assert_eq!(
            total.write_count,
            total.read_count - total.read_skip_count - total.filter_count
        );
    }
}
