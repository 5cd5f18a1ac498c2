pub mod pool;
pub mod supervisor;

pub use pool::{WorkerConfig, WorkerPool};
pub use supervisor::{ProcessSupervisor, RunnerCommand, TIMEOUT_EXIT_CODE};
