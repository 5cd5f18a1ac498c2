use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Sentinel exit code recorded when a run is cut short by the deadline or by
/// shutdown. Distinct from anything the runner returns on its success path.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How to invoke the external runner: `executable script <job args...>`.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub executable: String,
    pub script: String,
}

/// Runs one external program to completion under a deadline, streaming its
/// combined output to a log file.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    cmd: RunnerCommand,
}

enum Interrupt {
    Timeout,
    Shutdown,
}

impl ProcessSupervisor {
    pub fn new(cmd: RunnerCommand) -> Self {
        Self { cmd }
    }

    /// Launch the runner and wait for it to finish, the deadline to elapse,
    /// or `cancel` to fire — whichever happens first.
    ///
    /// stdout and stderr are interleaved into the log file in arrival
    /// order, flushed after each line so a live tail tracks progress. On
    /// timeout or cancellation the child is killed best-effort, a
    /// diagnostic line is appended, and [`TIMEOUT_EXIT_CODE`] is returned.
    /// On normal completion the runner's own exit code is returned
    /// unaltered; a non-zero code is an outcome, not an error. Only a
    /// process that cannot be started (or a log sink that cannot be
    /// written) aborts with [`EngineError::Launch`].
    pub async fn run(
        &self,
        args: &[String],
        log_path: &Path,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<i32, EngineError> {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(EngineError::Launch)?;
            }
        }
        let mut log = File::create(log_path).await.map_err(EngineError::Launch)?;

        // kill_on_drop: whatever survives our explicit kill below is reaped
        // when the child handle is dropped.
        let mut child = Command::new(&self.cmd.executable)
            .arg(&self.cmd.script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Launch)?;

        // Both streams feed one channel, so the log preserves arrival order.
        let (tx, mut rx) = mpsc::channel::<String>(256);
        spawn_stdout_reader(child.stdout.take(), tx.clone());
        spawn_stderr_reader(child.stderr.take(), tx);

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let interrupt = loop {
            tokio::select! {
                maybe_line = rx.recv() => match maybe_line {
                    Some(line) => {
                        log.write_all(line.as_bytes()).await.map_err(EngineError::Launch)?;
                        log.write_all(b"\n").await.map_err(EngineError::Launch)?;
                        log.flush().await.map_err(EngineError::Launch)?;
                    }
                    // Both pipes closed: the runner has exited (or handed
                    // its pipes to nobody). Fall through to wait().
                    None => break None,
                },
                _ = tokio::time::sleep_until(deadline) => break Some(Interrupt::Timeout),
                _ = cancel.cancelled() => break Some(Interrupt::Shutdown),
            }
        };

        if let Some(interrupt) = interrupt {
            // Best-effort: the caller wants control back promptly, so a
            // failed kill is swallowed rather than propagated.
            let _ = child.start_kill();

            let reason = match interrupt {
                Interrupt::Timeout => "timeout",
                Interrupt::Shutdown => "shutdown",
            };
            let diagnostic = format!(
                "[runflow] run terminated by {} after {:.1}s (exit code {})\n",
                reason,
                started.elapsed().as_secs_f64(),
                TIMEOUT_EXIT_CODE,
            );
            let _ = log.write_all(diagnostic.as_bytes()).await;
            let _ = log.flush().await;

            tracing::warn!(
                log = %log_path.display(),
                reason,
                elapsed_secs = started.elapsed().as_secs(),
                "runner terminated before completion"
            );
            return Ok(TIMEOUT_EXIT_CODE);
        }

        let status = child.wait().await.map_err(EngineError::Launch)?;
        // A child killed by a signal outside our control has no code;
        // record -1, distinct from 0 and from the sentinel.
        Ok(status.code().unwrap_or(-1))
    }
}

fn spawn_stdout_reader(stdout: Option<ChildStdout>, tx: mpsc::Sender<String>) {
    if let Some(stdout) = stdout {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
}

fn spawn_stderr_reader(stderr: Option<ChildStderr>, tx: mpsc::Sender<String>) {
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
}
