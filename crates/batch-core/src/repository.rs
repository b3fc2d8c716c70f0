//! Execution ledger
//!
//! Persists job instances (run identities), job executions (launches) and
//! step executions (per-step status, counters and restart offsets) in SQLite.
//! The chunk executor writes its checkpoint through
//! [`JobRepository::record_chunk_commit`] on the same connection that holds
//! the sink's writes, so a chunk and its checkpoint commit together.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqliteConnection, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::RepositoryConfig;
use crate::error::{BatchError, Result};
use crate::parameters::JobParameters;
use crate::types::{
    BatchStatus, ExecutionContext, JobExecution, RestartPoint, StepCounters, StepExecution,
};

/// SQLite-backed store of job and step execution state
#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
    stale_after: chrono::Duration,
}

impl std::fmt::Debug for JobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRepository")
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl JobRepository {
    /// Open (creating if needed) the database and apply the ledger schema
    pub async fn connect(config: &RepositoryConfig) -> Result<Self> {
        config.validate()?;

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let repository = Self::new(pool).with_stale_after(config.stale_after()?);
        repository.migrate().await?;

        info!(url = %config.url, "Execution ledger ready");
        Ok(repository)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            stale_after: chrono::Duration::seconds(crate::config::DEFAULT_STALE_EXECUTION_SECS),
        }
    }

    /// How long a `started` execution may go without a checkpoint before a
    /// new launch treats it as abandoned
    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Apply the ledger migrations; other crates' migrations in the same
    /// database are left alone.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open the transactional scope of one chunk commit.
    ///
    /// Dropping the returned transaction without committing rolls it back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Create a job execution for `job_name` and `parameters`.
    ///
    /// - no previous run: new instance, fresh execution
    /// - previous run completed: [`BatchError::AlreadyComplete`] unless `force`
    /// - previous run failed, stopped or abandoned: resumed execution
    /// - previous run still started: [`BatchError::AlreadyRunning`] unless its
    ///   last checkpoint is older than the staleness window, in which case it
    ///   is marked abandoned and resumed
    ///
    /// `force` always yields a fresh (non-resumed) execution.
    #[instrument(skip(self, parameters))]
    pub async fn start(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        force: bool,
    ) -> Result<JobExecution> {
        let job_key = parameters.identity_key();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM batch_job_instance WHERE job_name = ?1 AND job_key = ?2",
        )
        .bind(job_name)
        .bind(&job_key)
        .fetch_optional(&mut *tx)
        .await?;

        let (job_instance_id, resumed) = match existing {
            Some(instance_id) => {
                let resumed = self
                    .check_previous_execution(&mut tx, job_name, instance_id, force, now)
                    .await?;
                (instance_id, resumed)
            },
            None => {
                let instance_id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO batch_job_instance (job_name, job_key, created_at)
                    VALUES (?1, ?2, ?3)
                    RETURNING id
                    "#,
                )
                .bind(job_name)
                .bind(&job_key)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                (instance_id, false)
            },
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO batch_job_execution (
                job_instance_id, status, parameters, resumed, started_at, last_updated
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING id
            "#,
        )
        .bind(job_instance_id)
        .bind(BatchStatus::Started.as_str())
        .bind(serde_json::to_string(parameters)?)
        .bind(resumed)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            job_name,
            job_instance_id,
            job_execution_id = id,
            resumed,
            "Job execution started"
        );

        Ok(JobExecution {
            id,
            job_instance_id,
            job_name: job_name.to_string(),
            status: BatchStatus::Started,
            parameters: parameters.clone(),
            resumed,
            exit_message: None,
            started_at: now,
            ended_at: None,
            last_updated: now,
        })
    }

    /// Decide whether a launch against an existing instance may proceed and
    /// whether it resumes
    async fn check_previous_execution(
        &self,
        conn: &mut SqliteConnection,
        job_name: &str,
        job_instance_id: i64,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let last: Option<(i64, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, status, last_updated
            FROM batch_job_execution
            WHERE job_instance_id = ?1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(job_instance_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((execution_id, status, last_updated)) = last else {
            return Ok(false);
        };

        match BatchStatus::try_from(status)? {
            BatchStatus::Completed if force => {
                info!(job_name, job_instance_id, "Forcing re-run of a completed job instance");
                Ok(false)
            },
            BatchStatus::Completed => Err(BatchError::AlreadyComplete {
                job_name: job_name.to_string(),
                instance_id: job_instance_id,
            }),
            BatchStatus::Started | BatchStatus::NotStarted => {
                if now - last_updated < self.stale_after {
                    return Err(BatchError::AlreadyRunning {
                        job_name: job_name.to_string(),
                        execution_id,
                    });
                }

                warn!(
                    job_name,
                    job_execution_id = execution_id,
                    last_updated = %last_updated,
                    "Reclaiming stale job execution as abandoned"
                );
                self.mark_abandoned(conn, execution_id, now).await?;
                Ok(!force)
            },
            _ => Ok(!force),
        }
    }

    async fn mark_abandoned(
        &self,
        conn: &mut SqliteConnection,
        job_execution_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_job_execution
            SET status = ?1, ended_at = ?2, last_updated = ?2,
                exit_message = 'execution stopped making progress'
            WHERE id = ?3
            "#,
        )
        .bind(BatchStatus::Abandoned.as_str())
        .bind(now)
        .bind(job_execution_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            UPDATE batch_step_execution
            SET status = ?1, ended_at = ?2, last_updated = ?2
            WHERE job_execution_id = ?3 AND status = ?4
            "#,
        )
        .bind(BatchStatus::Abandoned.as_str())
        .bind(now)
        .bind(job_execution_id)
        .bind(BatchStatus::Started.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Latest execution of `step_name` across all launches of an instance
    pub async fn last_step_execution(
        &self,
        job_instance_id: i64,
        step_name: &str,
    ) -> Result<Option<StepExecution>> {
        let row: Option<StepExecutionRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.job_execution_id, s.step_name, s.status,
                   s.read_count, s.write_count, s.filter_count, s.read_skip_count,
                   s.retry_count, s.commit_count, s.rollback_count,
                   s.last_committed_offset, s.execution_context, s.exit_message,
                   s.started_at, s.ended_at
            FROM batch_step_execution s
            JOIN batch_job_execution j ON j.id = s.job_execution_id
            WHERE j.job_instance_id = ?1 AND s.step_name = ?2
            ORDER BY s.id DESC
            LIMIT 1
            "#,
        )
        .bind(job_instance_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StepExecution::try_from).transpose()
    }

    /// Create a step execution, seeded from `resume_from` when that earlier
    /// execution was interrupted
    #[instrument(skip(self, job_execution, resume_from), fields(job_execution_id = job_execution.id))]
    pub async fn start_step(
        &self,
        job_execution: &JobExecution,
        step_name: &str,
        resume_from: Option<&StepExecution>,
    ) -> Result<StepExecution> {
        let now = Utc::now();
        let (counters, offset, context) = match resume_from {
            Some(previous) if previous.status.is_restartable() => {
                info!(
                    step = step_name,
                    previous_step_execution_id = previous.id,
                    offset = previous.offset,
                    "Resuming step from last committed chunk"
                );
                (previous.counters, previous.offset, previous.context.clone())
            },
            _ => (StepCounters::default(), 0, ExecutionContext::new()),
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO batch_step_execution (
                job_execution_id, step_name, status,
                read_count, write_count, filter_count, read_skip_count,
                retry_count, commit_count, rollback_count,
                last_committed_offset, execution_context, started_at, last_updated
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            RETURNING id
            "#,
        )
        .bind(job_execution.id)
        .bind(step_name)
        .bind(BatchStatus::Started.as_str())
        .bind(counters.read_count as i64)
        .bind(counters.write_count as i64)
        .bind(counters.filter_count as i64)
        .bind(counters.read_skip_count as i64)
        .bind(counters.retry_count as i64)
        .bind(counters.commit_count as i64)
        .bind(counters.rollback_count as i64)
        .bind(offset as i64)
        .bind(serde_json::to_string(&context)?)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(StepExecution {
            id,
            job_execution_id: job_execution.id,
            step_name: step_name.to_string(),
            status: BatchStatus::Started,
            counters,
            offset,
            context,
            exit_message: None,
            started_at: now,
            ended_at: None,
        })
    }

    /// Checkpoint a committed chunk.
    ///
    /// `conn` must be the chunk's transaction so that the checkpoint and the
    /// sink's writes become durable together. Also refreshes the job
    /// execution's heartbeat.
    pub async fn record_chunk_commit(
        &self,
        conn: &mut SqliteConnection,
        step_execution_id: i64,
        offset: u64,
        counters: &StepCounters,
        context: &ExecutionContext,
    ) -> Result<()> {
        let now = Utc::now();

        let updated = sqlx::query(
            r#"
            UPDATE batch_step_execution
            SET read_count = ?1, write_count = ?2, filter_count = ?3, read_skip_count = ?4,
                retry_count = ?5, commit_count = ?6, rollback_count = ?7,
                last_committed_offset = ?8, execution_context = ?9, last_updated = ?10
            WHERE id = ?11
            "#,
        )
        .bind(counters.read_count as i64)
        .bind(counters.write_count as i64)
        .bind(counters.filter_count as i64)
        .bind(counters.read_skip_count as i64)
        .bind(counters.retry_count as i64)
        .bind(counters.commit_count as i64)
        .bind(counters.rollback_count as i64)
        .bind(offset as i64)
        .bind(serde_json::to_string(context)?)
        .bind(now)
        .bind(step_execution_id)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(BatchError::illegal_state(format!(
                "step execution {step_execution_id} does not exist"
            )));
        }

        sqlx::query(
            r#"
            UPDATE batch_job_execution
            SET last_updated = ?1
            WHERE id = (SELECT job_execution_id FROM batch_step_execution WHERE id = ?2)
            "#,
        )
        .bind(now)
        .bind(step_execution_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Record the terminal status of a step execution
    pub async fn complete(&self, execution: &StepExecution) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE batch_step_execution
            SET status = ?1, exit_message = ?2, rollback_count = ?3,
                ended_at = ?4, last_updated = ?4
            WHERE id = ?5
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.exit_message.as_deref())
        .bind(execution.counters.rollback_count as i64)
        .bind(execution.ended_at.unwrap_or(now))
        .bind(execution.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the terminal status of a job execution
    pub async fn complete_job(
        &self,
        job_execution_id: i64,
        status: BatchStatus,
        exit_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE batch_job_execution
            SET status = ?1, exit_message = ?2, ended_at = ?3, last_updated = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(exit_message)
        .bind(now)
        .bind(job_execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Where a relaunch with these parameters would continue, if the latest
    /// run was interrupted
    pub async fn find_restart_point(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<RestartPoint>> {
        let Some(latest) = self.job_executions(job_name, parameters).await?.pop() else {
            return Ok(None);
        };

        let stale = Utc::now() - latest.last_updated >= self.stale_after;
        let interrupted = latest.status.is_restartable()
            || (latest.status == BatchStatus::Started && stale);
        if !interrupted {
            return Ok(None);
        }

        let row: Option<StepExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, job_execution_id, step_name, status,
                   read_count, write_count, filter_count, read_skip_count,
                   retry_count, commit_count, rollback_count,
                   last_committed_offset, execution_context, exit_message,
                   started_at, ended_at
            FROM batch_step_execution
            WHERE job_execution_id = ?1 AND status != ?2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(latest.id)
        .bind(BatchStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(StepExecution::try_from)
            .transpose()?
            .map(|step| RestartPoint {
                job_execution_id: latest.id,
                step_name: step.step_name,
                status: step.status,
                offset: step.offset,
                counters: step.counters,
            }))
    }

    /// All executions of the instance identified by `job_name` and
    /// `parameters`, oldest first
    pub async fn job_executions(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Vec<JobExecution>> {
        let rows: Vec<JobExecutionRow> = sqlx::query_as(
            r#"
            SELECT j.id, j.job_instance_id, i.job_name, j.status, j.parameters, j.resumed,
                   j.exit_message, j.started_at, j.ended_at, j.last_updated
            FROM batch_job_execution j
            JOIN batch_job_instance i ON i.id = j.job_instance_id
            WHERE i.job_name = ?1 AND i.job_key = ?2
            ORDER BY j.id
            "#,
        )
        .bind(job_name)
        .bind(parameters.identity_key())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobExecution::try_from).collect()
    }

    pub async fn step_executions(&self, job_execution_id: i64) -> Result<Vec<StepExecution>> {
        let rows: Vec<StepExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, job_execution_id, step_name, status,
                   read_count, write_count, filter_count, read_skip_count,
                   retry_count, commit_count, rollback_count,
                   last_committed_offset, execution_context, exit_message,
                   started_at, ended_at
            FROM batch_step_execution
            WHERE job_execution_id = ?1
            ORDER BY id
            "#,
        )
        .bind(job_execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepExecution::try_from).collect()
    }

    /// Delete a job instance with all of its executions.
    ///
    /// Returns the number of instances removed (0 or 1).
    pub async fn remove_instance(&self, job_name: &str, parameters: &JobParameters) -> Result<u64> {
        let result = sqlx::query("DELETE FROM batch_job_instance WHERE job_name = ?1 AND job_key = ?2")
            .bind(job_name)
            .bind(parameters.identity_key())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!(job_name, "Removed job instance and its executions");
        }
        Ok(result.rows_affected())
    }
}

// Helper structs for sqlx query_as
#[derive(Debug, FromRow)]
struct JobExecutionRow {
    id: i64,
    job_instance_id: i64,
    job_name: String,
    status: String,
    parameters: String,
    resumed: bool,
    exit_message: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

impl TryFrom<JobExecutionRow> for JobExecution {
    type Error = BatchError;

    fn try_from(row: JobExecutionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_instance_id: row.job_instance_id,
            job_name: row.job_name,
            status: BatchStatus::try_from(row.status)?,
            parameters: serde_json::from_str(&row.parameters)?,
            resumed: row.resumed,
            exit_message: row.exit_message,
            started_at: row.started_at,
            ended_at: row.ended_at,
            last_updated: row.last_updated,
        })
    }
}

#[derive(Debug, FromRow)]
struct StepExecutionRow {
    id: i64,
    job_execution_id: i64,
    step_name: String,
    status: String,
    read_count: i64,
    write_count: i64,
    filter_count: i64,
    read_skip_count: i64,
    retry_count: i64,
    commit_count: i64,
    rollback_count: i64,
    last_committed_offset: i64,
    execution_context: String,
    exit_message: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepExecutionRow> for StepExecution {
    type Error = BatchError;

    fn try_from(row: StepExecutionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_execution_id: row.job_execution_id,
            step_name: row.step_name,
            status: BatchStatus::try_from(row.status)?,
            counters: StepCounters {
                read_count: row.read_count as u64,
                write_count: row.write_count as u64,
                filter_count: row.filter_count as u64,
                read_skip_count: row.read_skip_count as u64,
                retry_count: row.retry_count as u64,
                commit_count: row.commit_count as u64,
                rollback_count: row.rollback_count as u64,
            },
            offset: row.last_committed_offset as u64,
            context: serde_json::from_str(&row.execution_context)?,
            exit_message: row.exit_message,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}
