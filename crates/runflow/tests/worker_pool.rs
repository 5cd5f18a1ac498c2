mod common;

use common::{insert_queued_job, insert_queued_job_with_params, job_status, setup_db};

use std::time::{Duration, Instant};

use runflow::jobs::JobsRepo;
use runflow::runner::{ProcessSupervisor, RunnerCommand, WorkerConfig, WorkerPool};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sh_supervisor(dir: &TempDir, body: &str) -> ProcessSupervisor {
    let script = dir.path().join("runner.sh");
    std::fs::write(&script, body).expect("failed to write fixture script");
    ProcessSupervisor::new(RunnerCommand {
        executable: "sh".to_string(),
        script: script.display().to_string(),
    })
}

fn test_config(dir: &TempDir, max_concurrent: usize, run_timeout: Duration) -> WorkerConfig {
    WorkerConfig {
        enabled: true,
        poll_interval: Duration::from_millis(100),
        max_concurrent,
        run_timeout,
        log_dir: dir.path().join("logs"),
    }
}

/// Poll the store until the job leaves `queued`/`running` or the deadline
/// passes; returns the final observed status.
async fn wait_for_terminal(pool: &PgPool, id: uuid::Uuid, deadline: Duration) -> String {
    let start = Instant::now();
    loop {
        let status = job_status(pool, id).await;
        if status != "queued" && status != "running" {
            return status;
        }
        if start.elapsed() > deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
#[serial]
async fn pool_drives_a_job_to_succeeded() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    let job_id = insert_queued_job(&pool, "monthly_load", "202507", "I1").await;

    let shutdown = CancellationToken::new();
    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "echo processing \"$@\"\nexit 0\n"),
        test_config(&dir, 2, Duration::from_secs(10)),
        shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    let status = wait_for_terminal(&pool, job_id, Duration::from_secs(10)).await;
    assert_eq!(status, "succeeded");

    let job = JobsRepo::new(pool.clone())
        .find(job_id)
        .await
        .unwrap()
        .expect("job should exist");
    let log_path = job.log_path.expect("succeeded job must record a log path");
    let log = std::fs::read_to_string(&log_path).expect("log file should exist");
    assert!(log.contains("--period 202507"), "log was: {log}");
    assert_eq!(job.attempt, 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn nonzero_exit_marks_the_job_failed() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    let job_id = insert_queued_job(&pool, "monthly_load", "202507", "I1").await;

    let shutdown = CancellationToken::new();
    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "echo boom >&2\nexit 3\n"),
        test_config(&dir, 2, Duration::from_secs(10)),
        shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    let status = wait_for_terminal(&pool, job_id, Duration::from_secs(10)).await;
    assert_eq!(status, "failed");

    let job = JobsRepo::new(pool.clone())
        .find(job_id)
        .await
        .unwrap()
        .expect("job should exist");
    assert!(
        job.error.as_deref().unwrap_or_default().contains("code 3"),
        "error was: {:?}",
        job.error
    );
    assert!(job.log_path.is_some());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn timed_out_job_fails_with_sentinel_and_diagnostic() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    let job_id = insert_queued_job(&pool, "monthly_load", "202507", "I1").await;

    let shutdown = CancellationToken::new();
    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "sleep 30\n"),
        test_config(&dir, 2, Duration::from_millis(300)),
        shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    let status = wait_for_terminal(&pool, job_id, Duration::from_secs(10)).await;
    assert_eq!(status, "failed");

    let job = JobsRepo::new(pool.clone())
        .find(job_id)
        .await
        .unwrap()
        .expect("job should exist");
    assert!(
        job.error.as_deref().unwrap_or_default().contains("124"),
        "error was: {:?}",
        job.error
    );
    let log = std::fs::read_to_string(job.log_path.unwrap()).unwrap();
    assert!(log.contains("terminated by timeout"), "log was: {log}");

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn malformed_params_reach_failed_not_stuck_running() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    // Column values are present, but the parameter document is missing `q`,
    // so parsing inside the worker fails after the claim.
    let job_id = insert_queued_job_with_params(
        &pool,
        "monthly_load",
        "202507",
        "I1",
        json!({ "period": "202507" }),
    )
    .await;

    let shutdown = CancellationToken::new();
    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "exit 0\n"),
        test_config(&dir, 2, Duration::from_secs(10)),
        shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    let status = wait_for_terminal(&pool, job_id, Duration::from_secs(10)).await;
    assert_eq!(status, "failed");

    let job = JobsRepo::new(pool.clone())
        .find(job_id)
        .await
        .unwrap()
        .expect("job should exist");
    assert!(
        job.error
            .as_deref()
            .unwrap_or_default()
            .contains("invalid run parameters"),
        "error was: {:?}",
        job.error
    );
    assert!(job.log_path.is_none(), "no runner was launched");

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn pool_never_exceeds_max_concurrent() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(insert_queued_job(&pool, "monthly_load", "202507", &format!("I{i}")).await);
    }

    let shutdown = CancellationToken::new();
    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "sleep 0.4\nexit 0\n"),
        test_config(&dir, 2, Duration::from_secs(10)),
        shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    let started = Instant::now();
    loop {
        let running: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status='running'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(
            running <= 2,
            "more than max_concurrent jobs running at once: {running}"
        );

        let terminal: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('succeeded','failed','canceled')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        if terminal == 6 {
            break;
        }

        assert!(
            started.elapsed() < Duration::from_secs(20),
            "jobs did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // 6 jobs through 2 slots at ~0.4s each needs at least 3 waves
    assert!(
        started.elapsed() >= Duration::from_millis(1000),
        "finished suspiciously fast for a bounded pool: {:?}",
        started.elapsed()
    );

    for id in ids {
        assert_eq!(job_status(&pool, id).await, "succeeded");
    }

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
#[serial]
async fn shutdown_stops_claiming_new_jobs() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    let shutdown = CancellationToken::new();
    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "exit 0\n"),
        test_config(&dir, 2, Duration::from_secs(10)),
        shutdown.clone(),
    );
    let handle = tokio::spawn(worker.run());

    // Let the loop spin once, then shut it down.
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pool did not stop after shutdown")
        .unwrap();

    // Work enqueued after shutdown is left for the next process.
    let job_id = insert_queued_job(&pool, "monthly_load", "202507", "I1").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(job_status(&pool, job_id).await, "queued");
}

#[tokio::test]
#[serial]
async fn disabled_worker_never_polls() {
    let pool = setup_db().await;
    let dir = TempDir::new().unwrap();

    let job_id = insert_queued_job(&pool, "monthly_load", "202507", "I1").await;

    let mut cfg = test_config(&dir, 2, Duration::from_secs(10));
    cfg.enabled = false;

    let worker = WorkerPool::new(
        JobsRepo::new(pool.clone()),
        sh_supervisor(&dir, "exit 0\n"),
        cfg,
        CancellationToken::new(),
    );

    // run() returns immediately when the subsystem is disabled
    tokio::time::timeout(Duration::from_secs(1), worker.run())
        .await
        .expect("disabled pool should return at once");

    assert_eq!(job_status(&pool, job_id).await, "queued");
}
