//! Staging of the input file before ingestion

use async_trait::async_trait;
use batch_common::compute_file_checksum;
use batch_core::{BatchError, JobParameters, Result, StepContext, Tasklet};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::job::INPUT_FILE;

/// Context key holding the SHA-256 of the staged copy
pub const STAGED_CHECKSUM_KEY: &str = "staged.sha256";

/// Where the staged copy of `input.file` lives.
///
/// Each job instance stages into its own directory, named by the parameter
/// fingerprint, so instances whose inputs share a file name never read each
/// other's copy.
pub fn staged_path(staging_dir: &Path, parameters: &JobParameters) -> Result<PathBuf> {
    let input = Path::new(parameters.require(INPUT_FILE)?);
    let file_name = input.file_name().ok_or_else(|| {
        BatchError::invalid_parameters(format!("'{}' does not name a file", input.display()))
    })?;
    Ok(staging_dir.join(parameters.identity_key()).join(file_name))
}

/// Copies `input.file` into the staging directory and verifies the copy
pub struct FilePreparationTasklet {
    staging_dir: PathBuf,
}

impl FilePreparationTasklet {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }
}

async fn checksum(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || compute_file_checksum(path))
        .await
        .map_err(|e| BatchError::illegal_state(format!("checksum task failed: {e}")))?
        .map_err(BatchError::from)
}

#[async_trait]
impl Tasklet for FilePreparationTasklet {
    async fn execute(&self, ctx: &mut StepContext) -> Result<()> {
        let input = PathBuf::from(ctx.parameters.require(INPUT_FILE)?);
        let staged = staged_path(&self.staging_dir, &ctx.parameters)?;

        if !tokio::fs::try_exists(&input).await? {
            return Err(BatchError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input file {} does not exist", input.display()),
            )));
        }

        if let Some(dir) = staged.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // copying a file onto itself would truncate it
        let already_staged = match tokio::fs::canonicalize(&staged).await {
            Ok(existing) => existing == tokio::fs::canonicalize(&input).await?,
            Err(_) => false,
        };
        let bytes = if already_staged {
            tokio::fs::metadata(&staged).await?.len()
        } else {
            tokio::fs::copy(&input, &staged).await?
        };

        let expected = checksum(input.clone()).await?;
        let actual = checksum(staged.clone()).await?;
        if expected != actual {
            return Err(BatchError::processing(format!(
                "staged copy {} does not match {} (sha256 {actual} != {expected})",
                staged.display(),
                input.display()
            )));
        }

        ctx.execution
            .context
            .insert(STAGED_CHECKSUM_KEY.to_string(), actual.clone().into());

        info!(
            input = %input.display(),
            staged = %staged.display(),
            bytes,
            sha256 = %actual,
            "Input file staged"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_path_is_per_instance() {
        let january = JobParameters::new().with(INPUT_FILE, "/data/a/billing-2023-01.csv");
        let other = JobParameters::new().with(INPUT_FILE, "/data/b/billing-2023-01.csv");

        let staged = staged_path(Path::new("staging"), &january).unwrap();
        assert_eq!(
            staged,
            Path::new("staging").join(january.identity_key()).join("billing-2023-01.csv")
        );
        assert_ne!(staged, staged_path(Path::new("staging"), &other).unwrap());

        let root = JobParameters::new().with(INPUT_FILE, "/");
        assert!(staged_path(Path::new("staging"), &root).is_err());
    }
}
