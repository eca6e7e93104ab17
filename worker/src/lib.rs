pub mod logsink;
pub mod process;
pub mod worker;

pub use process::{ExitReason, Invocation, SupervisionSettings};
pub use worker::{worker_id, Engine, ExecutionSettings, WorkerPool};
