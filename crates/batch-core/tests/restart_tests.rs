//! Restart after failure, crash recovery and cooperative stop

mod common;

use batch_core::{BatchError, BatchStatus, JobLauncher, JobParameters, JobStatus, LaunchOptions};
use common::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_restart_resumes_after_last_committed_chunk() {
    init_tracing();
    let ledger = TestLedger::start().await.unwrap();
    let launcher = JobLauncher::new(ledger.repository.clone());
    let params = JobParameters::new().with("input.file", "restart.csv");
    let processor = FlakyProcessor::new();

    let failing = chunk_job(
        valid(1..=35),
        processor.clone(),
        WriterFault::FailOnChunk(3),
        config(10, 0, 1),
    );
    let first = launcher.run(&failing, params.clone()).await.unwrap();
    assert_eq!(first.status, JobStatus::Failed);
    assert_eq!(ledger.sink_values().await.unwrap(), (1..=20).collect::<Vec<_>>());

    let point = ledger
        .repository
        .find_restart_point(JOB_NAME, &params)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(point.step_name, STEP_NAME);
    assert_eq!(point.status, BatchStatus::Failed);
    assert_eq!(point.offset, 20);

    let healthy = chunk_job(valid(1..=35), processor.clone(), WriterFault::None, config(10, 0, 1));
    let second = launcher.run(&healthy, params.clone()).await.unwrap();
    assert!(second.is_completed());

    let counters = second.step(STEP_NAME).unwrap().counters;
    assert_eq!(counters.read_count, 35);
    assert_eq!(counters.write_count, 35);
    assert_eq!(counters.commit_count, 4);
    assert_eq!(counters.rollback_count, 1);

    // committed records are not processed again; the rolled back chunk is
    assert_eq!(processor.invocations(5), 1);
    assert_eq!(processor.invocations(25), 2);

    let executions = ledger.repository.job_executions(JOB_NAME, &params).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, BatchStatus::Failed);
    assert!(executions[1].resumed);
    assert_eq!(executions[1].status, BatchStatus::Completed);
    assert!(ledger
        .repository
        .find_restart_point(JOB_NAME, &params)
        .await
        .unwrap()
        .is_none());

    // same final output as a run that never failed
    let reference = TestLedger::start().await.unwrap();
    JobLauncher::new(reference.repository.clone())
        .run(&healthy, params.clone())
        .await
        .unwrap();
    assert_eq!(
        ledger.sink_values().await.unwrap(),
        reference.sink_values().await.unwrap()
    );
}

#[tokio::test]
async fn test_killed_run_is_reclaimed_once_stale() {
    let ledger = TestLedger::start().await.unwrap();
    let launcher = JobLauncher::new(ledger.repository.clone());
    let params = JobParameters::new().with("input.file", "killed.csv");

    let hanging = chunk_job(
        valid(1..=30),
        FlakyProcessor::new(),
        WriterFault::HangOnChunk(2),
        config(10, 0, 1),
    );
    let killed = tokio::time::timeout(
        Duration::from_millis(500),
        launcher.run(&hanging, params.clone()),
    )
    .await;
    assert!(killed.is_err(), "hanging run should not finish");

    let healthy = chunk_job(valid(1..=30), FlakyProcessor::new(), WriterFault::None, config(10, 0, 1));

    // recent heartbeat: looks alive
    let err = launcher.run(&healthy, params.clone()).await.unwrap_err();
    assert!(matches!(err, BatchError::AlreadyRunning { .. }));

    let reclaiming = JobLauncher::new(
        ledger
            .repository
            .clone()
            .with_stale_after(chrono::Duration::zero()),
    );
    let result = reclaiming.run(&healthy, params.clone()).await.unwrap();
    assert!(result.is_completed());
    assert_eq!(ledger.sink_values().await.unwrap(), (1..=30).collect::<Vec<_>>());

    let executions = ledger.repository.job_executions(JOB_NAME, &params).await.unwrap();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, BatchStatus::Abandoned);
    let steps = ledger.repository.step_executions(executions[0].id).await.unwrap();
    assert_eq!(steps[0].status, BatchStatus::Abandoned);
    assert_eq!(steps[0].offset, 10);
}

#[tokio::test]
async fn test_cancellation_stops_at_chunk_boundary_and_resumes() {
    let ledger = TestLedger::start().await.unwrap();
    let launcher = JobLauncher::new(ledger.repository.clone());
    let params = JobParameters::new().with("input.file", "stopped.csv");

    let cancel = CancellationToken::new();
    let stopping = chunk_job(
        valid(1..=40),
        FlakyProcessor::new().cancel_after(15, cancel.clone()),
        WriterFault::None,
        config(10, 0, 1),
    );
    let result = launcher
        .run_with(
            &stopping,
            params.clone(),
            LaunchOptions {
                force: false,
                cancel,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.step(STEP_NAME).unwrap().status, BatchStatus::Stopped);
    // the chunk in flight when the stop was requested still commits
    assert_eq!(ledger.sink_values().await.unwrap(), (1..=20).collect::<Vec<_>>());
    let executions = ledger.repository.job_executions(JOB_NAME, &params).await.unwrap();
    assert_eq!(executions[0].status, BatchStatus::Stopped);

    let healthy = chunk_job(valid(1..=40), FlakyProcessor::new(), WriterFault::None, config(10, 0, 1));
    let resumed = launcher.run(&healthy, params).await.unwrap();
    assert!(resumed.is_completed());
    assert_eq!(ledger.sink_values().await.unwrap(), (1..=40).collect::<Vec<_>>());
}
