use std::path::PathBuf;
use std::time::Duration;

use runflow::error::EngineError;
use runflow::runner::{ProcessSupervisor, RunnerCommand, TIMEOUT_EXIT_CODE};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Build a supervisor whose "runner script" is a shell fixture written into
/// the temp dir. Invoked as `sh <script> <args...>`, so no exec bit needed.
fn sh_supervisor(dir: &TempDir, body: &str) -> ProcessSupervisor {
    let script = dir.path().join("runner.sh");
    std::fs::write(&script, body).expect("failed to write fixture script");
    ProcessSupervisor::new(RunnerCommand {
        executable: "sh".to_string(),
        script: script.display().to_string(),
    })
}

fn log_path(dir: &TempDir) -> PathBuf {
    dir.path().join("run.log")
}

#[tokio::test]
async fn exit_zero_returns_zero_and_captures_both_streams() {
    let dir = TempDir::new().unwrap();
    let supervisor = sh_supervisor(
        &dir,
        "echo from-stdout\necho from-stderr >&2\nexit 0\n",
    );

    let code = supervisor
        .run(
            &[],
            &log_path(&dir),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(code, 0);

    let log = std::fs::read_to_string(log_path(&dir)).unwrap();
    assert!(log.contains("from-stdout"), "log was: {log}");
    assert!(log.contains("from-stderr"), "log was: {log}");
}

#[tokio::test]
async fn nonzero_exit_code_is_returned_unaltered() {
    let dir = TempDir::new().unwrap();
    let supervisor = sh_supervisor(&dir, "exit 7\n");

    let code = supervisor
        .run(
            &[],
            &log_path(&dir),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(code, 7);
}

#[tokio::test]
async fn timeout_returns_sentinel_and_appends_diagnostic() {
    let dir = TempDir::new().unwrap();
    let supervisor = sh_supervisor(&dir, "echo started\nsleep 5\necho never\n");

    let code = supervisor
        .run(
            &[],
            &log_path(&dir),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(code, TIMEOUT_EXIT_CODE);

    let log = std::fs::read_to_string(log_path(&dir)).unwrap();
    assert!(log.contains("started"), "log was: {log}");
    assert!(!log.contains("never"), "log was: {log}");
    assert!(log.contains("terminated by timeout"), "log was: {log}");
}

#[tokio::test]
async fn cancellation_is_treated_like_a_timeout() {
    let dir = TempDir::new().unwrap();
    let supervisor = sh_supervisor(&dir, "sleep 5\n");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let code = supervisor
        .run(&[], &log_path(&dir), Duration::from_secs(30), cancel)
        .await
        .unwrap();

    assert_eq!(code, TIMEOUT_EXIT_CODE);

    let log = std::fs::read_to_string(log_path(&dir)).unwrap();
    assert!(log.contains("terminated by shutdown"), "log was: {log}");
}

#[tokio::test]
async fn missing_executable_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let supervisor = ProcessSupervisor::new(RunnerCommand {
        executable: "runflow-no-such-binary".to_string(),
        script: "irrelevant.sh".to_string(),
    });

    let err = supervisor
        .run(
            &[],
            &log_path(&dir),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Launch(_)), "got: {err}");
}

#[tokio::test]
async fn log_parent_directories_are_created() {
    let dir = TempDir::new().unwrap();
    let supervisor = sh_supervisor(&dir, "echo hello\n");
    let nested = dir.path().join("logs/2025/07/run.log");

    let code = supervisor
        .run(
            &[],
            &nested,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert!(nested.exists());
}

#[tokio::test]
async fn job_arguments_reach_the_runner() {
    let dir = TempDir::new().unwrap();
    let supervisor = sh_supervisor(&dir, "echo \"$@\"\n");

    let args = vec![
        "--period".to_string(),
        "202507".to_string(),
        "--q".to_string(),
        "I2".to_string(),
    ];
    let code = supervisor
        .run(
            &args,
            &log_path(&dir),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(code, 0);

    let log = std::fs::read_to_string(log_path(&dir)).unwrap();
    assert!(log.contains("--period 202507 --q I2"), "log was: {log}");
}
