//! billing-job - monthly billing batch

use anyhow::Result;
use batch_common::logging::{init_logging, LogConfig, LogLevel};
use batch_core::{BatchError, JobLauncher, JobParameters, JobRepository, LaunchOptions};
use billing_job::{
    billing_job, store, BillingConfig, CatalogPricingService, DATA_MONTH, DATA_YEAR, INPUT_FILE,
    JOB_NAME, OUTPUT_FILE, SKIP_FILE,
};
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "billing-job")]
#[command(author, version, about = "Monthly billing batch job")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job, resuming an interrupted run with the same parameters
    Run {
        #[command(flatten)]
        params: ParamArgs,

        /// Run again even if these parameters already completed
        #[arg(long)]
        force: bool,
    },

    /// Show the latest execution for these parameters
    Status {
        #[command(flatten)]
        params: ParamArgs,
    },

    /// Forget every execution for these parameters
    Cleanup {
        #[command(flatten)]
        params: ParamArgs,
    },
}

/// Job parameters; together they identify the run
#[derive(Args, Debug)]
struct ParamArgs {
    /// Usage file to bill
    #[arg(short, long)]
    input: String,

    /// Report file (defaults to the staging directory)
    #[arg(short, long)]
    output: Option<String>,

    /// Skipped record log (defaults to the staging directory)
    #[arg(long)]
    skip_file: Option<String>,

    /// Only report this year
    #[arg(long, requires = "month")]
    year: Option<i32>,

    /// Only report this month (1-12)
    #[arg(long, requires = "year")]
    month: Option<u32>,
}

impl ParamArgs {
    fn to_parameters(&self) -> JobParameters {
        let mut params = JobParameters::new().with(INPUT_FILE, &self.input);
        if let Some(output) = &self.output {
            params = params.with(OUTPUT_FILE, output);
        }
        if let Some(skip_file) = &self.skip_file {
            params = params.with(SKIP_FILE, skip_file);
        }
        if let Some(year) = self.year {
            params = params.with(DATA_YEAR, year);
        }
        if let Some(month) = self.month {
            params = params.with(DATA_MONTH, month);
        }
        params
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("billing-job")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let _guard = match log_config.merge_env().and_then(|config| init_logging(&config)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "billing-job failed");
            ExitCode::FAILURE
        },
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    let config = BillingConfig::load()?;
    let repository = store::connect(&config).await?;

    match command {
        Command::Run { params, force } => launch(&config, repository, params.to_parameters(), force).await,
        Command::Status { params } => {
            status(&repository, &params.to_parameters()).await?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Cleanup { params } => {
            let removed = repository
                .remove_instance(JOB_NAME, &params.to_parameters())
                .await?;
            if removed == 0 {
                println!("No executions recorded for these parameters");
            } else {
                println!("Removed {removed} job instance(s)");
            }
            Ok(ExitCode::SUCCESS)
        },
    }
}

async fn launch(
    config: &BillingConfig,
    repository: JobRepository,
    parameters: JobParameters,
    force: bool,
) -> Result<ExitCode> {
    let pricing = Arc::new(CatalogPricingService::from_config(&config.pricing));
    let job = billing_job(config, pricing)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current chunk");
            on_signal.cancel();
        }
    });

    let options = LaunchOptions { force, cancel };
    let result = match JobLauncher::new(repository).run_with(&job, parameters, options).await {
        Ok(result) => result,
        Err(e @ (BatchError::AlreadyComplete { .. } | BatchError::AlreadyRunning { .. })) => {
            warn!(error = %e, "Launch refused");
            println!("{e}");
            return Ok(ExitCode::FAILURE);
        },
        Err(e) => return Err(e.into()),
    };

    println!("Job {} ({}): {}", result.job_name, result.job_execution_id, result.status);
    for step in &result.steps {
        let c = &step.counters;
        println!(
            "  {:<18} {:<10} read={} written={} filtered={} skipped={} retried={} commits={} rollbacks={}",
            step.step_name,
            step.status.to_string(),
            c.read_count,
            c.write_count,
            c.filter_count,
            c.read_skip_count,
            c.retry_count,
            c.commit_count,
            c.rollback_count
        );
        if let Some(message) = &step.exit_message {
            println!("    {message}");
        }
    }

    info!(status = %result.status, "Launch finished");
    Ok(if result.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn status(repository: &JobRepository, parameters: &JobParameters) -> Result<()> {
    let executions = repository.job_executions(JOB_NAME, parameters).await?;
    let Some(latest) = executions.last() else {
        println!("No executions recorded for these parameters");
        return Ok(());
    };

    println!(
        "Execution {} of {} ({} total): {}",
        latest.id,
        JOB_NAME,
        executions.len(),
        latest.status
    );
    println!("  started  {}", latest.started_at.to_rfc3339());
    if let Some(ended) = latest.ended_at {
        println!("  ended    {}", ended.to_rfc3339());
    }
    if let Some(message) = &latest.exit_message {
        println!("  message  {message}");
    }

    for step in repository.step_executions(latest.id).await? {
        println!(
            "  {:<18} {:<10} read={} written={} skipped={}",
            step.step_name,
            step.status.to_string(),
            step.counters.read_count,
            step.counters.write_count,
            step.counters.read_skip_count
        );
    }

    if let Some(point) = repository.find_restart_point(JOB_NAME, parameters).await? {
        println!(
            "A relaunch resumes step {} after {} items",
            point.step_name, point.offset
        );
    }
    Ok(())
}
