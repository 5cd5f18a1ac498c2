use std::path::PathBuf;
use std::time::Duration;

use crate::runner::{RunnerCommand, WorkerConfig};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub api_addr: Option<String>,
    pub migrate_on_startup: bool,

    pub worker_enabled: bool,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    pub run_timeout_secs: u64,

    pub runner_executable: String,
    pub runner_script: String,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let api_addr = env_or_fallback("RUNFLOW_API_ADDR", "API_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("RUNFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let worker_enabled = env_bool("RUNFLOW_WORKER_ENABLED").unwrap_or(true);

        let poll_interval_ms = env_or_fallback("RUNFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let max_concurrent = env_or_fallback("RUNFLOW_MAX_CONCURRENT", "MAX_CONCURRENT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let run_timeout_secs = env_or_fallback("RUNFLOW_RUN_TIMEOUT_SECS", "RUN_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600);

        let runner_executable = env_or_fallback("RUNFLOW_RUNNER_EXECUTABLE", "RUNNER_EXECUTABLE")
            .unwrap_or_else(|| "python3".to_string());

        let runner_script = env_or_fallback("RUNFLOW_RUNNER_SCRIPT", "RUNNER_SCRIPT")
            .unwrap_or_else(|| "scripts/run_steps.py".to_string());

        let log_dir = env_or_fallback("RUNFLOW_LOG_DIR", "LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));

        Ok(Self {
            database_url,
            api_addr,
            migrate_on_startup,
            worker_enabled,
            poll_interval_ms,
            max_concurrent,
            run_timeout_secs,
            runner_executable,
            runner_script,
            log_dir,
        })
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            enabled: self.worker_enabled,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_concurrent: self.max_concurrent,
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn runner(&self) -> RunnerCommand {
        RunnerCommand {
            executable: self.runner_executable.clone(),
            script: self.runner_script.clone(),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
