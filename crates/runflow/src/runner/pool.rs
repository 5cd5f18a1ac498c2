use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::jobs::{Job, JobsRepo, RunParams};
use crate::runner::supervisor::{ProcessSupervisor, TIMEOUT_EXIT_CODE};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub run_timeout: Duration,
    pub log_dir: PathBuf,
}

/// Bounded-concurrency driver loop: claims queued jobs from the store and
/// drives each through the supervisor to a terminal status.
///
/// The loop is the single scheduling authority. Each claimed job runs on its
/// own task holding one of `max_concurrent` semaphore permits; the permit is
/// owned by the task, so the slot is released on every exit path, panic
/// included.
pub struct WorkerPool {
    jobs: JobsRepo,
    supervisor: ProcessSupervisor,
    cfg: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        jobs: JobsRepo,
        supervisor: ProcessSupervisor,
        cfg: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            supervisor,
            cfg,
            shutdown,
        }
    }

    /// Run until the shutdown token fires. Jobs already dispatched are not
    /// abandoned by loop exit — they run to their own completion or timeout
    /// (the supervisor observes the same token and treats it like a
    /// deadline).
    pub async fn run(self) {
        if !self.cfg.enabled {
            tracing::info!("worker subsystem disabled; not polling");
            return;
        }

        let slots = Arc::new(Semaphore::new(self.cfg.max_concurrent.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        tracing::info!(
            max_concurrent = self.cfg.max_concurrent,
            poll_interval_ms = self.cfg.poll_interval.as_millis() as u64,
            "worker pool started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "job task aborted");
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.jobs.claim_one().await {
                Err(e) => {
                    // Transient store outage: not fatal, try again next poll.
                    drop(permit);
                    tracing::warn!(error = %e, "claim failed; retrying next poll");
                    if self.sleep_poll().await {
                        break;
                    }
                }
                Ok(None) => {
                    drop(permit);
                    if self.sleep_poll().await {
                        break;
                    }
                }
                Ok(Some(job)) => {
                    let jobs = self.jobs.clone();
                    let supervisor = self.supervisor.clone();
                    let cfg = self.cfg.clone();
                    let cancel = self.shutdown.clone();
                    in_flight.spawn(async move {
                        let _slot = permit;
                        execute_job(&jobs, &supervisor, &cfg, job, cancel).await;
                    });
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "worker pool draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "job task aborted");
            }
        }
        tracing::info!("worker pool stopped");
    }

    /// Back-pressure against an empty queue. Returns true if shutdown fired
    /// during the wait.
    async fn sleep_poll(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.cfg.poll_interval) => false,
        }
    }
}

/// Drive one claimed job to a terminal status. The catch-all arm guarantees
/// a job never stays stuck in `running` because of an internal error:
/// malformed parameters, launch failure, and store I/O all resolve to
/// `mark_failed`.
async fn execute_job(
    jobs: &JobsRepo,
    supervisor: &ProcessSupervisor,
    cfg: &WorkerConfig,
    job: Job,
    cancel: CancellationToken,
) {
    let job_id = job.id;
    tracing::info!(%job_id, job_type = %job.job_type, attempt = job.attempt, "claimed job");

    if let Err(err) = try_execute(jobs, supervisor, cfg, &job, cancel).await {
        tracing::warn!(%job_id, error = %err, "job failed before completion");
        if let Err(mark_err) = jobs.mark_failed(job_id, None, &err.to_string()).await {
            tracing::error!(%job_id, error = %mark_err, "could not record job failure");
        }
    }
}

async fn try_execute(
    jobs: &JobsRepo,
    supervisor: &ProcessSupervisor,
    cfg: &WorkerConfig,
    job: &Job,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let params = RunParams::from_value(&job.params)?;

    // Job id in the file name keeps concurrent runs and re-enqueued
    // attempts of the same logical work from colliding.
    let log_path = cfg
        .log_dir
        .join(format!("{}_{}_{}.log", params.period, params.q, job.id));

    let code = supervisor
        .run(&params.to_args(), &log_path, cfg.run_timeout, cancel)
        .await?;

    let log_str = log_path.display().to_string();
    if code == 0 {
        jobs.mark_succeeded(job.id, &log_str).await?;
        tracing::info!(job_id = %job.id, log = %log_str, "job succeeded");
    } else {
        let diagnostic = if code == TIMEOUT_EXIT_CODE {
            format!("runner timed out or was canceled (exit code {code})")
        } else {
            format!("runner exited with code {code}")
        };
        jobs.mark_failed(job.id, Some(&log_str), &diagnostic).await?;
        tracing::warn!(job_id = %job.id, code, "job failed");
    }

    Ok(())
}
