use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Step sequence used when the request does not name one.
pub const DEFAULT_STEPS: [&str; 3] = ["extract", "transform", "load"];

/// Typed view of a job's parameter document.
///
/// `period` and `q` identify the run for idempotency purposes and must be
/// present. Everything else is optional, and fields this schema does not
/// know about are preserved in `extra` and stored unmodified — the runner
/// script is free to interpret them.
#[derive(Debug, Clone, Deserialize)]
pub struct RunParams {
    pub period: String,
    pub q: String,

    #[serde(default, alias = "dry-run")]
    pub dry_run: bool,

    #[serde(default)]
    pub steps: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunParams {
    pub fn from_value(value: &Value) -> Result<Self, EngineError> {
        serde_json::from_value(value.clone()).map_err(|e| EngineError::BadParams(e.to_string()))
    }

    pub fn steps_or_default(&self) -> Vec<String> {
        if self.steps.is_empty() {
            DEFAULT_STEPS.iter().map(|s| s.to_string()).collect()
        } else {
            self.steps.clone()
        }
    }

    /// Render the argument vector handed to the runner process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--period".to_string(),
            self.period.clone(),
            "--q".to_string(),
            self.q.clone(),
        ];
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args.push("--steps".to_string());
        args.push(self.steps_or_default().join(","));
        args
    }
}
