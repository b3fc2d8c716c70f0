//! Steps: the units a job is composed of
//!
//! A step receives a [`StepContext`] holding its execution record and the
//! ledger. Chunk-oriented steps are built with [`crate::ChunkStep`]; one-shot
//! work runs as a [`Tasklet`] wrapped in a [`TaskletStep`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::error::Result;
use crate::parameters::JobParameters;
use crate::repository::JobRepository;
use crate::types::{BatchStatus, StepExecution};

/// Everything a running step can see
pub struct StepContext {
    pub job_name: String,
    pub parameters: JobParameters,
    /// Counters, offset and restart state; mutated as chunks commit
    pub execution: StepExecution,
    pub repository: JobRepository,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn step_name(&self) -> &str {
        &self.execution.step_name
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Run the step to its terminal status.
    ///
    /// An `Err` means the step failed; the job records it as `failed` with
    /// the error as exit message. Returning `Ok(BatchStatus::Stopped)` means
    /// the step honoured a cancellation request.
    async fn execute(&self, ctx: &mut StepContext) -> Result<BatchStatus>;
}

/// A single unit of non-chunked work
#[async_trait]
pub trait Tasklet: Send + Sync {
    async fn execute(&self, ctx: &mut StepContext) -> Result<()>;
}

/// Runs a [`Tasklet`] as one transaction-free step and records one commit
pub struct TaskletStep<T> {
    name: String,
    tasklet: T,
}

impl<T: Tasklet> TaskletStep<T> {
    pub fn new(name: impl Into<String>, tasklet: T) -> Self {
        Self {
            name: name.into(),
            tasklet,
        }
    }
}

#[async_trait]
impl<T: Tasklet> Step for TaskletStep<T> {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, ctx), fields(step = %self.name))]
    async fn execute(&self, ctx: &mut StepContext) -> Result<BatchStatus> {
        if ctx.cancel.is_cancelled() {
            return Ok(BatchStatus::Stopped);
        }

        self.tasklet.execute(ctx).await?;

        let mut tx = ctx.repository.begin().await?;
        ctx.execution.counters.commit_count += 1;
        ctx.repository
            .record_chunk_commit(
                &mut tx,
                ctx.execution.id,
                ctx.execution.offset,
                &ctx.execution.counters,
                &ctx.execution.context,
            )
            .await?;
        tx.commit().await?;

        info!("Tasklet finished");
        Ok(BatchStatus::Completed)
    }
}
