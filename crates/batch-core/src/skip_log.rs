//! Skip log: one `line_number|raw_text` line per skipped record

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{BatchError, Result};
use crate::file::open_for_append;
use crate::item::SkipListener;
use crate::types::ExecutionContext;

/// Appends skipped records to a pipe-delimited log file.
///
/// A fresh step execution appends to whatever the file already holds; a
/// restarted one first truncates to the length committed by the interrupted
/// execution, so each skipped record is logged exactly once.
pub struct SkipLogWriter {
    path: PathBuf,
    state_key: String,
    file: Option<File>,
    position: u64,
}

impl SkipLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state_key: "skip_log.position".to_string(),
            file: None,
            position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format_entry(error: &BatchError) -> String {
        match error {
            BatchError::MalformedInput {
                line_number, raw, ..
            } => format!("{line_number}|{raw}\n"),
            other => format!("0|{other}\n"),
        }
    }
}

#[async_trait]
impl SkipListener for SkipLogWriter {
    async fn open(&mut self, context: &ExecutionContext) -> Result<()> {
        let (file, position) = open_for_append(&self.path, context, &self.state_key).await?;
        self.file = Some(file);
        self.position = position;
        Ok(())
    }

    async fn on_skip_in_read(&mut self, error: &BatchError) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BatchError::illegal_state("skip log used before open"))?;

        let entry = Self::format_entry(error);
        file.write_all(entry.as_bytes()).await?;
        file.sync_data().await?;
        self.position += entry.len() as u64;

        debug!(path = %self.path.display(), "Logged skipped record");
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
