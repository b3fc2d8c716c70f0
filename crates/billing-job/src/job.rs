//! The billing job: stage the usage file, load it, report the big spenders
//!
//! | Step                | Kind    | Reads             | Writes                      |
//! |---------------------|---------|-------------------|-----------------------------|
//! | `filePreparation`   | tasklet | `input.file`      | per-instance staged copy    |
//! | `fileIngestion`     | chunk   | staged copy       | `billing_data`, skip log    |
//! | `reportGeneration`  | chunk   | `billing_data`    | report CSV                  |

use batch_core::{
    BatchError, ChunkOrientedStep, ChunkStep, DefaultJobParametersValidator, DelimitedFileReader,
    DelimitedFileWriter, Job, JobParameters, JobParametersValidator, PassThroughProcessor, Result,
    SkipLogWriter, StepContext, TaskletStep,
};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::BillingConfig;
use crate::model::{BillingData, ReportingData};
use crate::preparation::{staged_path, FilePreparationTasklet};
use crate::processor::{BillingDataProcessor, PricingService};
use crate::reader::{BillingDataTableReader, BillingPeriod};
use crate::writer::BillingDataTableWriter;

pub const JOB_NAME: &str = "billingJob";

pub const INPUT_FILE: &str = "input.file";
pub const OUTPUT_FILE: &str = "output.file";
pub const SKIP_FILE: &str = "skip.file";
pub const DATA_YEAR: &str = "data.year";
pub const DATA_MONTH: &str = "data.month";

pub const FILE_PREPARATION_STEP: &str = "filePreparation";
pub const FILE_INGESTION_STEP: &str = "fileIngestion";
pub const REPORT_GENERATION_STEP: &str = "reportGeneration";

/// Columns per input line
const INPUT_FIELDS: usize = 7;

const REPORT_WRITER_STATE_KEY: &str = "report_writer.position";

/// Requires `input.file`, accepts the output, skip log and period keys, and
/// checks the period when one is given.
#[derive(Debug, Clone)]
pub struct BillingParametersValidator {
    keys: DefaultJobParametersValidator,
}

impl Default for BillingParametersValidator {
    fn default() -> Self {
        Self {
            keys: DefaultJobParametersValidator::new(
                [INPUT_FILE],
                [OUTPUT_FILE, SKIP_FILE, DATA_YEAR, DATA_MONTH],
            ),
        }
    }
}

impl JobParametersValidator for BillingParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<()> {
        self.keys.validate(parameters)?;
        billing_period(parameters)?;
        Ok(())
    }
}

/// The `(data.year, data.month)` filter of the report, if any.
///
/// Year and month must be given together; the month must be 1 to 12.
pub fn billing_period(parameters: &JobParameters) -> Result<Option<BillingPeriod>> {
    let year = parameters.get_i64(DATA_YEAR)?;
    let month = parameters.get_i64(DATA_MONTH)?;

    match (year, month) {
        (None, None) => Ok(None),
        (Some(year), Some(month)) => {
            if !(1..=12).contains(&month) {
                return Err(BatchError::invalid_parameters(format!(
                    "{DATA_MONTH} must be between 1 and 12, got {month}"
                )));
            }
            let year = i32::try_from(year).map_err(|_| {
                BatchError::invalid_parameters(format!("{DATA_YEAR} is out of range: {year}"))
            })?;
            Ok(Some((year, month as i32)))
        },
        _ => Err(BatchError::invalid_parameters(format!(
            "{DATA_YEAR} and {DATA_MONTH} must be given together"
        ))),
    }
}

fn path_or(parameters: &JobParameters, key: &str, default: PathBuf) -> PathBuf {
    parameters
        .get(key)
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

/// Build the billing job.
///
/// `pricing` is shared by every launch of the returned job.
pub fn billing_job(config: &BillingConfig, pricing: Arc<dyn PricingService>) -> Result<Job> {
    let preparation = TaskletStep::new(
        FILE_PREPARATION_STEP,
        FilePreparationTasklet::new(config.staging_dir.clone()),
    );

    let ingestion = {
        let config = config.clone();
        ChunkOrientedStep::new(FILE_INGESTION_STEP, move |ctx: &StepContext| {
            let staged = staged_path(&config.staging_dir, &ctx.parameters)?;
            let skip_file = path_or(&ctx.parameters, SKIP_FILE, config.default_skip_file());

            Ok(ChunkStep::new(
                DelimitedFileReader::<BillingData>::new(staged)
                    .lines_to_skip(1)
                    .expected_fields(INPUT_FIELDS),
                PassThroughProcessor::<BillingData>::new(),
                BillingDataTableWriter::new(),
                config.batch.chunk_size,
            )
            .fault_tolerant(&config.batch)
            .with_skip_listener(SkipLogWriter::new(skip_file)))
        })
    };

    let report = {
        let config = config.clone();
        ChunkOrientedStep::new(REPORT_GENERATION_STEP, move |ctx: &StepContext| {
            let period = billing_period(&ctx.parameters)?;
            let output = path_or(&ctx.parameters, OUTPUT_FILE, config.default_output_file());

            Ok(ChunkStep::new(
                BillingDataTableReader::new(
                    ctx.repository.pool().clone(),
                    period,
                    config.batch.chunk_size,
                ),
                BillingDataProcessor::new(pricing.clone(), config.pricing.spending_threshold),
                DelimitedFileWriter::<ReportingData>::new(output).state_key(REPORT_WRITER_STATE_KEY),
                config.batch.chunk_size,
            )
            .fault_tolerant(&config.batch))
        })
    };

    Job::builder(JOB_NAME)
        .validator(BillingParametersValidator::default())
        .start(preparation)
        .next(ingestion)
        .next(report)
        .build()
}
