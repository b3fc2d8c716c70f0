//! Read, process and write capabilities of a chunk-oriented step
//!
//! Implement these traits for each source, transform and sink; the chunk
//! executor composes them and owns transactions, skipping and retrying.

use async_trait::async_trait;
use sqlx::SqliteConnection;
use std::marker::PhantomData;

use crate::error::{BatchError, Result};
use crate::types::ExecutionContext;

/// Lazily produces records from a source
#[async_trait]
pub trait ItemReader: Send {
    type Item: Send + Sync;

    /// Prepare the source; `context` holds the state saved at the last commit
    async fn open(&mut self, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Next record, `Ok(None)` once the source is exhausted.
    ///
    /// Unparseable input must be reported as [`BatchError::MalformedInput`]
    /// so that skip policies can recognise it.
    async fn read(&mut self) -> Result<Option<Self::Item>>;

    /// Position the source after the first `offset` records.
    ///
    /// The default reads and discards; malformed records count towards the
    /// offset because they were consumed (and skipped) before the restart.
    async fn jump_to_item(&mut self, offset: u64) -> Result<()> {
        for _ in 0..offset {
            match self.read().await {
                Ok(Some(_)) => {},
                Ok(None) => break,
                Err(e) if e.is_malformed_input() => {},
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Transforms one record into zero or one output records
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync;

    /// `Ok(None)` filters the record out of the chunk.
    ///
    /// Return [`BatchError::Transient`] for failures worth retrying.
    async fn process(&self, item: &Self::Input) -> Result<Option<Self::Output>>;
}

/// Persists a chunk of records as one unit
#[async_trait]
pub trait ItemWriter: Send {
    type Item: Send + Sync;

    async fn open(&mut self, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Write `items` using `conn`, which is inside the chunk's transaction.
    ///
    /// Sinks outside the database must record enough state in
    /// [`ItemWriter::update`] to undo an uncommitted write on restart.
    async fn write(&mut self, items: &[Self::Item], conn: &mut SqliteConnection) -> Result<()>;

    /// Save restart state; called after `write` and before the commit
    fn update(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Observes records rejected by the skip policy.
///
/// Called during the commit of the chunk in which the skip happened.
#[async_trait]
pub trait SkipListener: Send {
    async fn open(&mut self, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn on_skip_in_read(&mut self, error: &BatchError) -> Result<()>;

    fn update(&mut self, _context: &mut ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Processor for steps without a transform
pub struct PassThroughProcessor<T>(PhantomData<fn() -> T>);

impl<T> PassThroughProcessor<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for PassThroughProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ItemProcessor for PassThroughProcessor<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    async fn process(&self, item: &T) -> Result<Option<T>> {
        Ok(Some(item.clone()))
    }
}
