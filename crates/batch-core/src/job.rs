//! Jobs and the launcher that runs them
//!
//! A [`Job`] is an ordered list of steps plus an optional parameter
//! validator. [`JobLauncher`] validates parameters, registers the run in the
//! ledger, skips steps a previous launch already completed and runs the rest
//! in order, stopping at the first step that does not complete.

use chrono::Utc;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{BatchError, Result};
use crate::parameters::{JobParameters, JobParametersValidator};
use crate::repository::JobRepository;
use crate::step::{Step, StepContext};
use crate::types::{BatchStatus, JobExecution, JobResult, JobStatus, StepResult};

pub struct Job {
    name: String,
    steps: Vec<Box<dyn Step>>,
    validator: Option<Box<dyn JobParametersValidator>>,
}

impl Job {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            steps: Vec::new(),
            validator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name())
    }

    pub fn validate(&self, parameters: &JobParameters) -> Result<()> {
        match &self.validator {
            Some(validator) => validator.validate(parameters),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("steps", &self.step_names().collect::<Vec<_>>())
            .finish()
    }
}

pub struct JobBuilder {
    name: String,
    steps: Vec<Box<dyn Step>>,
    validator: Option<Box<dyn JobParametersValidator>>,
}

impl JobBuilder {
    pub fn start(self, step: impl Step + 'static) -> Self {
        self.next(step)
    }

    pub fn next(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn validator(mut self, validator: impl JobParametersValidator + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Step names must be unique within a job since restarts look steps up
    /// by name.
    pub fn build(self) -> Result<Job> {
        if self.steps.is_empty() {
            return Err(BatchError::illegal_state(format!(
                "job '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(BatchError::illegal_state(format!(
                    "job '{}' has more than one step named '{}'",
                    self.name,
                    step.name()
                )));
            }
        }

        Ok(Job {
            name: self.name,
            steps: self.steps,
            validator: self.validator,
        })
    }
}

/// Per-launch options
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Run again even if these parameters already completed
    pub force: bool,
    /// Checked between chunks; cancelling stops the running step
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct JobLauncher {
    repository: JobRepository,
}

impl JobLauncher {
    pub fn new(repository: JobRepository) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &JobRepository {
        &self.repository
    }

    pub async fn run(&self, job: &Job, parameters: JobParameters) -> Result<JobResult> {
        self.run_with(job, parameters, LaunchOptions::default()).await
    }

    /// Launch `job`.
    ///
    /// Returns `Err` when the launch is refused (invalid parameters, already
    /// complete, already running) or the ledger fails. Step failures are
    /// reported through a `FAILED` [`JobResult`].
    #[instrument(skip(self, job, parameters, options), fields(job = %job.name))]
    pub async fn run_with(
        &self,
        job: &Job,
        parameters: JobParameters,
        options: LaunchOptions,
    ) -> Result<JobResult> {
        job.validate(&parameters)?;

        let execution = self
            .repository
            .start(&job.name, &parameters, options.force)
            .await?;

        let outcome = self.run_steps(job, &execution, &parameters, &options).await;
        let (status, steps, exit_message) = match outcome {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, job_execution_id = execution.id, "Job aborted by ledger failure");
                if let Err(mark_err) = self
                    .repository
                    .complete_job(execution.id, BatchStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    warn!(error = %mark_err, "Failed to record job failure");
                }
                return Err(e);
            },
        };

        self.repository
            .complete_job(execution.id, status, exit_message.as_deref())
            .await?;

        let job_status = if status == BatchStatus::Completed {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        info!(
            job_execution_id = execution.id,
            status = %job_status,
            "Job finished"
        );

        Ok(JobResult {
            job_execution_id: execution.id,
            job_name: job.name.clone(),
            status: job_status,
            steps,
            exit_message,
        })
    }

    async fn run_steps(
        &self,
        job: &Job,
        execution: &JobExecution,
        parameters: &JobParameters,
        options: &LaunchOptions,
    ) -> Result<(BatchStatus, Vec<StepResult>, Option<String>)> {
        let mut results = Vec::with_capacity(job.steps.len());

        for step in &job.steps {
            let previous = if execution.resumed {
                self.repository
                    .last_step_execution(execution.job_instance_id, step.name())
                    .await?
            } else {
                None
            };

            if let Some(previous) = previous.as_ref().filter(|p| p.status == BatchStatus::Completed) {
                info!(step = step.name(), "Step already completed by an earlier launch, skipping");
                results.push(StepResult::from(previous));
                continue;
            }

            let step_execution = self
                .repository
                .start_step(execution, step.name(), previous.as_ref())
                .await?;

            info!(step = step.name(), step_execution_id = step_execution.id, "Executing step");

            let mut ctx = StepContext {
                job_name: job.name.clone(),
                parameters: parameters.clone(),
                execution: step_execution,
                repository: self.repository.clone(),
                cancel: options.cancel.clone(),
            };
            let outcome = step.execute(&mut ctx).await;

            let mut step_execution = ctx.execution;
            match outcome {
                Ok(status) => step_execution.status = status,
                Err(e) => {
                    error!(step = step.name(), error = %e, "Step failed");
                    step_execution.status = BatchStatus::Failed;
                    step_execution.exit_message = Some(e.to_string());
                },
            }
            if step_execution.status == BatchStatus::Stopped {
                step_execution.exit_message = Some("stopped on request".to_string());
            }
            step_execution.ended_at = Some(Utc::now());

            self.repository.complete(&step_execution).await?;
            results.push(StepResult::from(&step_execution));

            if step_execution.status != BatchStatus::Completed {
                return Ok((step_execution.status, results, step_execution.exit_message));
            }
        }

        Ok((BatchStatus::Completed, results, None))
    }
}
