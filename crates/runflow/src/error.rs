/// Errors surfaced by the engine.
///
/// A timed-out run or a non-zero runner exit is not an error — both are
/// recorded outcomes on the job row. Only conditions the caller must react
/// to get a variant here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An active run with the same (job_type, period, q) already exists.
    #[error("an active run already exists for ({job_type}, {period}, {q})")]
    Conflict {
        job_type: String,
        period: String,
        q: String,
    },

    /// The job's parameter document could not be parsed into `RunParams`.
    #[error("invalid run parameters: {0}")]
    BadParams(String),

    /// The runner process could not be started or awaited.
    #[error("failed to launch runner process: {0}")]
    Launch(#[source] std::io::Error),

    /// The job store is unreachable or a write failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }
}
