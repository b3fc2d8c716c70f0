//! Shared fixtures for billing job integration tests
//!
//! Each fixture owns a temporary directory holding the SQLite database, the
//! staging directory and the job's output files.

#![allow(dead_code)]

use anyhow::Result;
use batch_core::{Job, JobLauncher, JobParameters};
use billing_job::{
    billing_job, store, BillingConfig, CatalogPricingService, PricingService, INPUT_FILE,
    OUTPUT_FILE, SKIP_FILE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const HEADER: &str = "data_year,data_month,account_id,phone_number,data_usage,call_duration,sms_count";

/// Header plus nine records, two of them malformed (lines 4 and 6)
pub const JANUARY: &[&str] = &[
    HEADER,
    "2023,1,100,555-0100,2000.5,300,50",
    "2023,1,101,555-0101,100,20,10",
    "2023,1,102,555-0102,abc,20,10",
    "2023,1,103,555-0103,500,200,5",
    "2023,1,104,555-0104,50,10",
    "2023,1,105,555-0105,10000,400,100",
    "2023,1,106,555-0106,0,0,0",
    "2023,1,107,555-0107,300.25,310,12",
    "2023,1,108,555-0108,1,1,1",
];

pub struct BillingFixture {
    pub dir: TempDir,
    pub config: BillingConfig,
    pub launcher: JobLauncher,
}

impl BillingFixture {
    pub async fn start() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut BillingConfig)) -> Result<Self> {
        let dir = tempfile::tempdir()?;

        let mut config = BillingConfig::default();
        config.database.url = format!("sqlite://{}", dir.path().join("batch.db").display());
        config.staging_dir = dir.path().join("staging");
        customize(&mut config);
        config.validate()?;

        let repository = store::connect(&config).await?;
        Ok(Self {
            dir,
            config,
            launcher: JobLauncher::new(repository),
        })
    }

    /// The billing job priced by the configured catalog
    pub fn job(&self) -> Result<Job> {
        self.job_with(Arc::new(CatalogPricingService::from_config(&self.config.pricing)))
    }

    pub fn job_with(&self, pricing: Arc<dyn PricingService>) -> Result<Job> {
        Ok(billing_job(&self.config, pricing)?)
    }

    pub fn write_input(&self, name: &str, lines: &[&str]) -> Result<PathBuf> {
        let path = self.dir.path().join("incoming").join(name);
        std::fs::create_dir_all(path.parent().unwrap_or(self.dir.path()))?;
        std::fs::write(&path, lines.join("\n") + "\n")?;
        Ok(path)
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.path().join("out").join("report.csv")
    }

    pub fn skip_path(&self) -> PathBuf {
        self.dir.path().join("out").join("skipped.psv")
    }

    /// Parameters pointing the report and skip log into the fixture directory
    pub fn parameters(&self, input: &Path) -> JobParameters {
        JobParameters::new()
            .with(INPUT_FILE, input.display())
            .with(OUTPUT_FILE, self.report_path().display())
            .with(SKIP_FILE, self.skip_path().display())
    }

    pub fn report_lines(&self) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(self.report_path())?;
        Ok(content.lines().map(str::to_string).collect())
    }

    pub fn skip_log(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.skip_path())?)
    }

    pub async fn billing_rows(&self) -> Result<i64> {
        store::count_billing_rows(self.launcher.repository().pool()).await
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.launcher.repository().pool())
            .await?;
        Ok(count)
    }
}

/// Account ids of the report, in file order
pub fn reported_accounts(lines: &[String]) -> Vec<i64> {
    lines
        .iter()
        .filter_map(|line| line.split(',').nth(2))
        .filter_map(|account| account.parse().ok())
        .collect()
}

/// Usage of generated account `i`
pub fn generated_usage(i: i64) -> (f64, i64, i64) {
    ((i * 37 % 5000) as f64, i * 7 % 400, i % 60)
}

/// `count` well-formed January records with varied usage
pub fn generated_lines(count: i64) -> Vec<String> {
    let mut lines = vec![HEADER.to_string()];
    for i in 0..count {
        let (data, call, sms) = generated_usage(i);
        lines.push(format!("2023,1,{},555-{:04},{data},{call},{sms}", 1000 + i, i));
    }
    lines
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("batch_core=debug,billing_job=debug")
        .with_test_writer()
        .try_init();
}
