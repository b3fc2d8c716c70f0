//! Shared fixtures for batch engine integration tests
//!
//! Every test gets its own SQLite file in a temporary directory. The test
//! doubles here script reader input, processor failures and writer faults so
//! that chunk boundaries, skips, retries and restarts can be asserted exactly.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use batch_core::{
    BatchConfig, BatchError, ChunkOrientedStep, ChunkStep, ItemProcessor,
    ItemReader, ItemWriter, Job, JobRepository, RepositoryConfig, Step, StepContext,
};
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const JOB_NAME: &str = "testJob";
pub const STEP_NAME: &str = "load";

/// Ledger database in a temporary directory, plus the `sink_items` table the
/// [`TableWriter`] writes to
pub struct TestLedger {
    pub dir: TempDir,
    pub repository: JobRepository,
}

impl TestLedger {
    pub async fn start() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut RepositoryConfig)) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = RepositoryConfig::with_url(format!(
            "sqlite://{}",
            dir.path().join("batch.db").display()
        ));
        customize(&mut config);

        let repository = JobRepository::connect(&config).await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS sink_items (value INTEGER NOT NULL)")
            .execute(repository.pool())
            .await?;

        Ok(Self { dir, repository })
    }

    pub async fn sink_values(&self) -> Result<Vec<i64>> {
        let values = sqlx::query_scalar("SELECT value FROM sink_items ORDER BY rowid")
            .fetch_all(self.repository.pool())
            .await?;
        Ok(values)
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.repository.pool())
            .await?;
        Ok(count)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("batch_core=debug")
        .with_test_writer()
        .try_init();
}

/// One scripted source record
#[derive(Debug, Clone)]
pub enum Entry {
    Valid(i64),
    Malformed(&'static str),
}

pub fn valid(range: std::ops::RangeInclusive<i64>) -> Vec<Entry> {
    range.map(Entry::Valid).collect()
}

/// Yields scripted entries; entry `n` (0-based) is reported as line `n + 1`
pub struct ScriptedReader {
    entries: Vec<Entry>,
    position: usize,
}

impl ScriptedReader {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            position: 0,
        }
    }
}

#[async_trait]
impl ItemReader for ScriptedReader {
    type Item = i64;

    async fn read(&mut self) -> batch_core::Result<Option<i64>> {
        let Some(entry) = self.entries.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        match entry {
            Entry::Valid(value) => Ok(Some(*value)),
            Entry::Malformed(raw) => Err(BatchError::malformed(
                self.position as u64,
                *raw,
                "unparseable",
            )),
        }
    }
}

/// Processor with scripted failures.
///
/// Clones share invocation counts, so a processor can be reused across
/// launches to assert how often each record was processed overall.
#[derive(Clone, Default)]
pub struct FlakyProcessor {
    transient_failures: HashMap<i64, u32>,
    permanent_failures: HashSet<i64>,
    filter_multiples_of: Option<i64>,
    cancel_after: Option<(i64, CancellationToken)>,
    invocations: Arc<Mutex<HashMap<i64, u32>>>,
}

impl FlakyProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `item` transiently on its first `times` attempts
    pub fn fail_transiently(mut self, item: i64, times: u32) -> Self {
        self.transient_failures.insert(item, times);
        self
    }

    pub fn fail_permanently(mut self, item: i64) -> Self {
        self.permanent_failures.insert(item);
        self
    }

    pub fn filter_multiples_of(mut self, n: i64) -> Self {
        self.filter_multiples_of = Some(n);
        self
    }

    /// Cancel `token` while processing `item`
    pub fn cancel_after(mut self, item: i64, token: CancellationToken) -> Self {
        self.cancel_after = Some((item, token));
        self
    }

    pub fn invocations(&self, item: i64) -> u32 {
        self.invocations
            .lock()
            .map(|calls| calls.get(&item).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ItemProcessor for FlakyProcessor {
    type Input = i64;
    type Output = i64;

    async fn process(&self, item: &i64) -> batch_core::Result<Option<i64>> {
        let attempt = {
            let mut calls = self
                .invocations
                .lock()
                .map_err(|_| BatchError::illegal_state("poisoned"))?;
            let count = calls.entry(*item).or_insert(0);
            *count += 1;
            *count
        };

        if let Some((trigger, token)) = &self.cancel_after {
            if trigger == item {
                token.cancel();
            }
        }
        if self.permanent_failures.contains(item) {
            return Err(BatchError::processing(format!("item {item} is poison")));
        }
        if let Some(times) = self.transient_failures.get(item) {
            if attempt <= *times {
                return Err(BatchError::transient(format!(
                    "item {item} attempt {attempt} timed out"
                )));
            }
        }
        if matches!(self.filter_multiples_of, Some(n) if item % n == 0) {
            return Ok(None);
        }
        Ok(Some(*item))
    }
}

/// What a [`TableWriter`] does on its n-th write call (1-based)
#[derive(Debug, Clone, Copy, Default)]
pub enum WriterFault {
    #[default]
    None,
    FailOnChunk(usize),
    /// Insert, then never return, like a process killed mid-commit
    HangOnChunk(usize),
}

/// Inserts items into `sink_items` on the chunk transaction
pub struct TableWriter {
    fault: WriterFault,
    calls: usize,
}

impl TableWriter {
    pub fn new(fault: WriterFault) -> Self {
        Self { fault, calls: 0 }
    }
}

#[async_trait]
impl ItemWriter for TableWriter {
    type Item = i64;

    async fn write(&mut self, items: &[i64], conn: &mut SqliteConnection) -> batch_core::Result<()> {
        self.calls += 1;
        if matches!(self.fault, WriterFault::FailOnChunk(n) if n == self.calls) {
            return Err(BatchError::Io(std::io::Error::other("sink unavailable")));
        }

        for item in items {
            sqlx::query("INSERT INTO sink_items (value) VALUES (?1)")
                .bind(*item)
                .execute(&mut *conn)
                .await?;
        }

        if matches!(self.fault, WriterFault::HangOnChunk(n) if n == self.calls) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Single chunk step over scripted entries
pub fn chunk_step(
    entries: Vec<Entry>,
    processor: FlakyProcessor,
    fault: WriterFault,
    config: BatchConfig,
) -> impl Step {
    ChunkOrientedStep::new(STEP_NAME, move |_ctx: &StepContext| {
        Ok(ChunkStep::new(
            ScriptedReader::new(entries.clone()),
            processor.clone(),
            TableWriter::new(fault),
            config.chunk_size,
        )
        .fault_tolerant(&config))
    })
}

pub fn chunk_job(
    entries: Vec<Entry>,
    processor: FlakyProcessor,
    fault: WriterFault,
    config: BatchConfig,
) -> Job {
    Job::builder(JOB_NAME)
        .start(chunk_step(entries, processor, fault, config))
        .build()
        .unwrap_or_else(|e| panic!("invalid test job: {e}"))
}

pub fn config(chunk_size: usize, skip_limit: u64, retry_limit: u32) -> BatchConfig {
    BatchConfig {
        chunk_size,
        skip_limit,
        retry_limit,
        retry_backoff_ms: 0,
    }
}

/// Tasklet that counts its runs and fails while `fail` is set
#[derive(Clone, Default)]
pub struct CountingTasklet {
    pub runs: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
}

impl CountingTasklet {
    pub fn failing() -> Self {
        let tasklet = Self::default();
        tasklet.fail.store(true, Ordering::SeqCst);
        tasklet
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl batch_core::Tasklet for CountingTasklet {
    async fn execute(&self, _ctx: &mut StepContext) -> batch_core::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BatchError::processing("tasklet told to fail"));
        }
        Ok(())
    }
}
