//! Monthly billing batch job
//!
//! Stages a delimited usage file, loads it into the `billing_data` table and
//! writes a report of every record whose billing total reaches the spending
//! threshold. The job runs on the [`batch_core`] engine, so a failed launch
//! resumes where it stopped when relaunched with the same parameters.
//!
//! # Example
//!
//! ```no_run
//! use billing_job::{billing_job, store, BillingConfig, CatalogPricingService, INPUT_FILE};
//! use batch_core::{JobLauncher, JobParameters};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BillingConfig::load()?;
//! let repository = store::connect(&config).await?;
//! let pricing = Arc::new(CatalogPricingService::from_config(&config.pricing));
//!
//! let job = billing_job(&config, pricing)?;
//! let result = JobLauncher::new(repository)
//!     .run(&job, JobParameters::new().with(INPUT_FILE, "billing-2023-01.csv"))
//!     .await?;
//! println!("{}", result.status);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod job;
pub mod model;
pub mod preparation;
pub mod processor;
pub mod reader;
pub mod store;
pub mod writer;

pub use config::{BillingConfig, PricingConfig};
pub use job::{
    billing_job, billing_period, BillingParametersValidator, DATA_MONTH, DATA_YEAR,
    FILE_INGESTION_STEP, FILE_PREPARATION_STEP, INPUT_FILE, JOB_NAME, OUTPUT_FILE,
    REPORT_GENERATION_STEP, SKIP_FILE,
};
pub use model::{BillingData, ReportingData};
pub use preparation::{staged_path, FilePreparationTasklet, STAGED_CHECKSUM_KEY};
pub use processor::{BillingDataProcessor, CatalogPricingService, PricingRates, PricingService};
pub use reader::{BillingDataTableReader, BillingPeriod};
pub use writer::BillingDataTableWriter;
