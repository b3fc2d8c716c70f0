//! Delimited flat-file reader and writer
//!
//! The reader parses one record per physical line and reports unparseable
//! lines as [`BatchError::MalformedInput`] carrying the 1-based line number
//! and the raw text. The writer remembers how many bytes were durable at the
//! last chunk commit and truncates back to that length on restart, so the
//! file never holds output from a rolled-back chunk.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::error::{BatchError, Result};
use crate::item::{ItemReader, ItemWriter};
use crate::types::ExecutionContext;

/// Reads delimited records into `T`, by field position
pub struct DelimitedFileReader<T> {
    path: PathBuf,
    delimiter: u8,
    lines_to_skip: u64,
    expected_fields: Option<usize>,
    source: Option<BufReader<File>>,
    line_number: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T> DelimitedFileReader<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
            lines_to_skip: 0,
            expected_fields: None,
            source: None,
            line_number: 0,
            _item: PhantomData,
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Leading lines (e.g. a header) to ignore; they still count towards
    /// line numbers
    pub fn lines_to_skip(mut self, lines: u64) -> Self {
        self.lines_to_skip = lines;
        self
    }

    /// Reject lines with any other number of fields
    pub fn expected_fields(mut self, fields: usize) -> Self {
        self.expected_fields = Some(fields);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: DeserializeOwned> DelimitedFileReader<T> {
    fn parse(&self, line: &str) -> Result<T> {
        let malformed = |reason: String| BatchError::malformed(self.line_number, line, reason);

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(line.as_bytes());

        let mut record = csv::StringRecord::new();
        match reader.read_record(&mut record) {
            Ok(true) => {},
            Ok(false) => return Err(malformed("empty record".to_string())),
            Err(e) => return Err(malformed(e.to_string())),
        }

        if let Some(expected) = self.expected_fields {
            if record.len() != expected {
                return Err(malformed(format!(
                    "expected {expected} fields, found {}",
                    record.len()
                )));
            }
        }

        record
            .deserialize::<T>(None)
            .map_err(|e| malformed(e.to_string()))
    }
}

#[async_trait]
impl<T> ItemReader for DelimitedFileReader<T>
where
    T: DeserializeOwned + Send + Sync,
{
    type Item = T;

    async fn open(&mut self, _context: &ExecutionContext) -> Result<()> {
        let file = File::open(&self.path).await.map_err(|e| {
            BatchError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot open {}: {e}", self.path.display()),
            ))
        })?;
        self.source = Some(BufReader::new(file));
        self.line_number = 0;
        debug!(path = %self.path.display(), "Opened delimited file");
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<T>> {
        let mut buf = Vec::new();
        loop {
            let source = self
                .source
                .as_mut()
                .ok_or_else(|| BatchError::illegal_state("reader read before open"))?;

            buf.clear();
            if source.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }

            if self.line_number <= self.lines_to_skip {
                continue;
            }
            // undecodable lines are records like any other malformed one
            let line = std::str::from_utf8(&buf).map_err(|e| {
                BatchError::malformed(
                    self.line_number,
                    String::from_utf8_lossy(&buf),
                    format!("invalid UTF-8: {e}"),
                )
            })?;
            if line.trim().is_empty() {
                continue;
            }
            return self.parse(line).map(Some);
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.source = None;
        Ok(())
    }
}

/// Open `path` for writing at `position`, dropping anything past it
async fn reopen_at(path: &Path, position: u64) -> Result<File> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    let len = file.metadata().await?.len();
    if len < position {
        return Err(BatchError::illegal_state(format!(
            "{} is shorter ({len} bytes) than its committed length ({position} bytes)",
            path.display()
        )));
    }
    file.set_len(position).await?;
    file.seek(SeekFrom::Start(position)).await?;
    Ok(file)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Writes records as delimited lines.
///
/// A fresh step execution overwrites the file; a restarted one continues
/// after the last committed byte.
pub struct DelimitedFileWriter<T> {
    path: PathBuf,
    delimiter: u8,
    state_key: String,
    file: Option<File>,
    position: u64,
    _item: PhantomData<fn(T)>,
}

impl<T> DelimitedFileWriter<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
            state_key: "file_writer.position".to_string(),
            file: None,
            position: 0,
            _item: PhantomData,
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Execution context key for the committed length; must be unique per
    /// step when a step has several file writers
    pub fn state_key(mut self, key: impl Into<String>) -> Self {
        self.state_key = key.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> ItemWriter for DelimitedFileWriter<T>
where
    T: Serialize + Send + Sync,
{
    type Item = T;

    async fn open(&mut self, context: &ExecutionContext) -> Result<()> {
        ensure_parent(&self.path).await?;

        match context.get(&self.state_key).and_then(|v| v.as_u64()) {
            Some(position) => {
                info!(path = %self.path.display(), position, "Resuming output file at committed length");
                self.file = Some(reopen_at(&self.path, position).await?);
                self.position = position;
            },
            None => {
                self.file = Some(File::create(&self.path).await?);
                self.position = 0;
            },
        }
        Ok(())
    }

    async fn write(&mut self, items: &[T], _conn: &mut SqliteConnection) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BatchError::illegal_state("writer used before open"))?;

        let mut buffer = Vec::new();
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .delimiter(self.delimiter)
                .from_writer(&mut buffer);
            for item in items {
                writer.serialize(item)?;
            }
            writer.flush()?;
        }

        file.write_all(&buffer).await?;
        file.sync_data().await?;
        self.position += buffer.len() as u64;
        Ok(())
    }

    fn update(&mut self, context: &mut ExecutionContext) -> Result<()> {
        context.insert(self.state_key.clone(), self.position.into());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

pub(crate) async fn open_for_append(
    path: &Path,
    context: &ExecutionContext,
    state_key: &str,
) -> Result<(File, u64)> {
    ensure_parent(path).await?;

    match context.get(state_key).and_then(|v| v.as_u64()) {
        Some(position) => Ok((reopen_at(path, position).await?, position)),
        None => {
            let file = OpenOptions::new().create(true).append(true).open(path).await?;
            let position = file.metadata().await?.len();
            Ok((file, position))
        },
    }
}
