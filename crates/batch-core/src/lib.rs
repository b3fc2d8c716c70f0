//! Chunk-oriented batch processing engine
//!
//! Jobs are ordered lists of steps. Chunk-oriented steps read records one at
//! a time, optionally transform them, and write them in chunks; every chunk
//! is written and checkpointed in a single SQLite transaction so that a
//! failed or killed run can be relaunched with the same parameters and
//! resume after the last committed chunk.
//!
//! # Example
//!
//! ```no_run
//! use batch_core::{
//!     BatchConfig, ChunkOrientedStep, ChunkStep, DelimitedFileReader, DelimitedFileWriter,
//!     Job, JobLauncher, JobParameters, JobRepository, PassThroughProcessor, RepositoryConfig,
//!     StepContext,
//! };
//!
//! #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! struct Line {
//!     id: i64,
//!     name: String,
//! }
//!
//! # async fn example() -> batch_core::Result<()> {
//! let repository = JobRepository::connect(&RepositoryConfig::with_url("sqlite://batch.db")).await?;
//! let config = BatchConfig::default();
//!
//! let copy = ChunkOrientedStep::new("copy", move |ctx: &StepContext| {
//!     let input = ctx.parameters.require("input.file")?;
//!     Ok(ChunkStep::new(
//!         DelimitedFileReader::<Line>::new(input).lines_to_skip(1),
//!         PassThroughProcessor::new(),
//!         DelimitedFileWriter::<Line>::new("copy.csv"),
//!         config.chunk_size,
//!     )
//!     .fault_tolerant(&config))
//! });
//!
//! let job = Job::builder("copyJob").start(copy).build()?;
//! let result = JobLauncher::new(repository)
//!     .run(&job, JobParameters::new().with("input.file", "lines.csv"))
//!     .await?;
//! println!("{}", result.status);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod chunk;
pub mod config;
pub mod error;
pub mod file;
pub mod item;
pub mod job;
pub mod parameters;
pub mod policy;
pub mod repository;
pub mod skip_log;
pub mod step;
pub mod types;

pub use chunk::{ChunkOrientedStep, ChunkStep};
pub use config::{BatchConfig, RepositoryConfig};
pub use error::{BatchError, Result};
pub use file::{DelimitedFileReader, DelimitedFileWriter};
pub use item::{ItemProcessor, ItemReader, ItemWriter, PassThroughProcessor, SkipListener};
pub use job::{Job, JobBuilder, JobLauncher, LaunchOptions};
pub use parameters::{DefaultJobParametersValidator, JobParameters, JobParametersValidator};
pub use policy::{
    LimitCheckingSkipPolicy, NeverRetryPolicy, NeverSkipPolicy, RetryDecision, RetryPolicy,
    SimpleRetryPolicy, SkipDecision, SkipPolicy,
};
pub use repository::JobRepository;
pub use skip_log::SkipLogWriter;
pub use step::{Step, StepContext, Tasklet, TaskletStep};
pub use types::{
    BatchStatus, ExecutionContext, JobExecution, JobResult, JobStatus, RestartPoint, StepCounters,
    StepExecution, StepResult,
};

// Re-exported so implementors of `ItemWriter` and `Step` need not depend on
// these crates directly
pub use async_trait::async_trait;
pub use sqlx::SqliteConnection;
pub use tokio_util::sync::CancellationToken;
