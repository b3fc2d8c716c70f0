//! Chunk-oriented step execution
//!
//! Records are read and processed one at a time and collected into chunks of
//! `chunk_size` successfully read items. Each chunk is written and
//! checkpointed inside one transaction:
//!
//! 1. writer writes the chunk on the transaction's connection
//! 2. skip listeners see the records skipped while filling the chunk
//! 3. writer and listeners save restart state into the execution context
//! 4. counters, offset and context are recorded in the ledger
//! 5. commit
//!
//! A failure anywhere before the commit drops the transaction, which rolls
//! back both the sink writes and the checkpoint. The step then fails and a
//! later launch resumes from the last committed offset.

use async_trait::async_trait;
use std::marker::PhantomData;
use tracing::{debug, info, instrument, warn};

use crate::config::BatchConfig;
use crate::error::{BatchError, Result};
use crate::item::{ItemProcessor, ItemReader, ItemWriter, SkipListener};
use crate::policy::{
    NeverRetryPolicy, NeverSkipPolicy, RetryDecision, RetryPolicy, SkipDecision, SkipPolicy,
};
use crate::step::{Step, StepContext};
use crate::types::{BatchStatus, StepCounters};

/// Items gathered for one commit
struct Chunk<T> {
    items: Vec<T>,
    skipped: Vec<BatchError>,
    /// Counter deltas of this chunk, excluding `write_count` and `commit_count`
    counters: StepCounters,
    /// Source records consumed, including skipped ones
    consumed: u64,
}

impl<T> Chunk<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            skipped: Vec::new(),
            counters: StepCounters::default(),
            consumed: 0,
        }
    }
}

/// Reader, processor and writer composed into a fault-tolerant chunk loop.
///
/// Built fresh for each step execution and consumed by [`ChunkStep::execute`].
pub struct ChunkStep<R, P, W> {
    reader: R,
    processor: P,
    writer: W,
    chunk_size: usize,
    skip_policy: Box<dyn SkipPolicy>,
    retry_policy: Box<dyn RetryPolicy>,
    skip_listeners: Vec<Box<dyn SkipListener>>,
}

impl<R, P, W> ChunkStep<R, P, W>
where
    R: ItemReader,
    P: ItemProcessor<Input = R::Item>,
    W: ItemWriter<Item = P::Output>,
{
    /// A step that neither skips nor retries
    pub fn new(reader: R, processor: P, writer: W, chunk_size: usize) -> Self {
        Self {
            reader,
            processor,
            writer,
            chunk_size: chunk_size.max(1),
            skip_policy: Box::new(NeverSkipPolicy),
            retry_policy: Box::new(NeverRetryPolicy),
            skip_listeners: Vec::new(),
        }
    }

    /// Apply chunk size, skip limit and retry limit from `config`
    pub fn fault_tolerant(self, config: &BatchConfig) -> Self {
        let mut step = self
            .with_skip_policy(config.skip_policy())
            .with_retry_policy(config.retry_policy());
        step.chunk_size = config.chunk_size.max(1);
        step
    }

    pub fn with_skip_policy(mut self, policy: impl SkipPolicy + 'static) -> Self {
        self.skip_policy = Box::new(policy);
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Box::new(policy);
        self
    }

    pub fn with_skip_listener(mut self, listener: impl SkipListener + 'static) -> Self {
        self.skip_listeners.push(Box::new(listener));
        self
    }

    /// Run chunks until the reader is exhausted, a chunk fails, or
    /// cancellation is requested.
    ///
    /// Resources are closed on every path. On failure
    /// `ctx.execution.counters.rollback_count` has been incremented and the
    /// remaining counters reflect the last committed chunk.
    #[instrument(skip_all, fields(step = %ctx.execution.step_name, step_execution_id = ctx.execution.id))]
    pub async fn execute(mut self, ctx: &mut StepContext) -> Result<BatchStatus> {
        let outcome = self.run(ctx).await;
        let closed = self.close().await;

        let status = match (outcome, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "Failed to close step resources after failure");
                }
                return Err(e);
            },
            (Ok(status), closed) => {
                closed?;
                status
            },
        };

        let counters = &ctx.execution.counters;
        info!(
            status = %status,
            read = counters.read_count,
            written = counters.write_count,
            filtered = counters.filter_count,
            skipped = counters.read_skip_count,
            retries = counters.retry_count,
            commits = counters.commit_count,
            "Chunk step finished"
        );
        Ok(status)
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<BatchStatus> {
        self.reader.open(&ctx.execution.context).await?;
        self.writer.open(&ctx.execution.context).await?;
        for listener in &mut self.skip_listeners {
            listener.open(&ctx.execution.context).await?;
        }
        self.checkpoint_opened_state(ctx).await?;

        if ctx.execution.offset > 0 {
            info!(offset = ctx.execution.offset, "Fast-forwarding reader past committed items");
            self.reader.jump_to_item(ctx.execution.offset).await?;
        }

        loop {
            if ctx.cancel.is_cancelled() {
                info!(offset = ctx.execution.offset, "Stop requested, ending step at chunk boundary");
                return Ok(BatchStatus::Stopped);
            }

            let result = match self.fill_chunk(ctx).await {
                Ok(chunk) if chunk.consumed == 0 => break,
                Ok(chunk) => self.commit(ctx, chunk).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                ctx.execution.counters.rollback_count += 1;
                warn!(
                    error = %e,
                    offset = ctx.execution.offset,
                    "Chunk rolled back"
                );
                return Err(e);
            }
        }

        Ok(BatchStatus::Completed)
    }

    /// Persist the restart state the writer and listeners report right after
    /// opening, so that output from a chunk that never committed is undone
    /// even when it was the first chunk.
    async fn checkpoint_opened_state(&mut self, ctx: &mut StepContext) -> Result<()> {
        let mut context = ctx.execution.context.clone();
        self.writer.update(&mut context)?;
        for listener in &mut self.skip_listeners {
            listener.update(&mut context)?;
        }
        if context == ctx.execution.context {
            return Ok(());
        }

        let mut tx = ctx.repository.begin().await?;
        ctx.repository
            .record_chunk_commit(
                &mut *tx,
                ctx.execution.id,
                ctx.execution.offset,
                &ctx.execution.counters,
                &context,
            )
            .await?;
        tx.commit().await?;

        ctx.execution.context = context;
        Ok(())
    }

    async fn fill_chunk(&mut self, ctx: &StepContext) -> Result<Chunk<W::Item>> {
        let mut chunk = Chunk::with_capacity(self.chunk_size);
        let mut read = 0usize;

        while read < self.chunk_size {
            match self.reader.read().await {
                Ok(Some(item)) => {
                    read += 1;
                    chunk.consumed += 1;
                    chunk.counters.read_count += 1;

                    let output = process_with_retry(
                        &self.processor,
                        self.retry_policy.as_ref(),
                        &item,
                        &mut chunk.counters,
                    )
                    .await?;
                    match output {
                        Some(output) => chunk.items.push(output),
                        None => chunk.counters.filter_count += 1,
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    let skip_count =
                        ctx.execution.counters.read_skip_count + chunk.counters.read_skip_count;
                    match self.skip_policy.should_skip(&e, skip_count) {
                        SkipDecision::Skip => {
                            warn!(error = %e, skip_count = skip_count + 1, "Skipping unreadable record");
                            chunk.consumed += 1;
                            chunk.counters.read_count += 1;
                            chunk.counters.read_skip_count += 1;
                            chunk.skipped.push(e);
                        },
                        SkipDecision::Abort if e.is_malformed_input() => {
                            return Err(BatchError::SkipLimitExceeded {
                                limit: self.skip_policy.skip_limit(),
                                source: Box::new(e),
                            });
                        },
                        SkipDecision::Abort => return Err(e),
                    }
                },
            }
        }

        Ok(chunk)
    }

    async fn commit(&mut self, ctx: &mut StepContext, chunk: Chunk<W::Item>) -> Result<()> {
        let mut tx = ctx.repository.begin().await?;

        if !chunk.items.is_empty() {
            self.writer.write(&chunk.items, &mut *tx).await?;
        }
        for skipped in &chunk.skipped {
            for listener in &mut self.skip_listeners {
                listener.on_skip_in_read(skipped).await?;
            }
        }

        let mut context = ctx.execution.context.clone();
        self.writer.update(&mut context)?;
        for listener in &mut self.skip_listeners {
            listener.update(&mut context)?;
        }

        let mut counters = ctx.execution.counters;
        counters += chunk.counters;
        counters.write_count += chunk.items.len() as u64;
        counters.commit_count += 1;
        let offset = ctx.execution.offset + chunk.consumed;

        ctx.repository
            .record_chunk_commit(&mut *tx, ctx.execution.id, offset, &counters, &context)
            .await?;
        tx.commit().await?;

        debug!(
            offset,
            written = chunk.items.len(),
            skipped = chunk.skipped.len(),
            filtered = chunk.counters.filter_count,
            "Chunk committed"
        );

        ctx.execution.counters = counters;
        ctx.execution.offset = offset;
        ctx.execution.context = context;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_error = None;

        if let Err(e) = self.reader.close().await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.writer.close().await {
            first_error.get_or_insert(e);
        }
        for listener in &mut self.skip_listeners {
            if let Err(e) = listener.close().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn process_with_retry<P>(
    processor: &P,
    retry_policy: &dyn RetryPolicy,
    item: &P::Input,
    counters: &mut StepCounters,
) -> Result<Option<P::Output>>
where
    P: ItemProcessor,
{
    let mut attempts = 0u32;
    loop {
        match processor.process(item).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                attempts += 1;
                match retry_policy.should_retry(&e, attempts) {
                    RetryDecision::Retry => {
                        counters.retry_count += 1;
                        debug!(attempt = attempts, error = %e, "Retrying record");
                        let delay = retry_policy.backoff(attempts);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    },
                    RetryDecision::Abort if e.is_transient() => {
                        return Err(BatchError::RetryLimitExceeded {
                            attempts,
                            source: Box::new(e),
                        });
                    },
                    RetryDecision::Abort => return Err(e),
                }
            },
        }
    }
}

/// Adapts a per-execution [`ChunkStep`] factory into a [`Step`].
///
/// `build` runs at the start of every step execution, so readers and writers
/// can be configured from the job parameters.
pub struct ChunkOrientedStep<F, R, P, W> {
    name: String,
    build: F,
    _parts: PhantomData<fn() -> (R, P, W)>,
}

impl<F, R, P, W> ChunkOrientedStep<F, R, P, W>
where
    F: Fn(&StepContext) -> Result<ChunkStep<R, P, W>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            build,
            _parts: PhantomData,
        }
    }
}

#[async_trait]
impl<F, R, P, W> Step for ChunkOrientedStep<F, R, P, W>
where
    F: Fn(&StepContext) -> Result<ChunkStep<R, P, W>> + Send + Sync,
    R: ItemReader + 'static,
    P: ItemProcessor<Input = R::Item> + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<BatchStatus> {
        let step = (self.build)(ctx)?;
        step.execute(ctx).await
    }
}
