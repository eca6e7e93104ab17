pub mod api;
pub mod error;
pub mod fsutil;
pub mod job;
pub mod queue;
pub mod results;
pub mod store;

pub use api::{ApiResponse, CancelResponse, CancelResult, EnvelopeStatus, ErrorDetails, SubmitResponse};
pub use error::OrchestratorError;
pub use job::{
    derive_job_id, split_network_name, FailureKind, JobId, JobManifest, JobParameters, JobStatus,
};
pub use queue::{EntryState, JobHandle, Lease, LeaseControl, QueueEntry, RemoveOutcome, TaskQueue};
pub use results::{result_download_path, status_path, PublicState, ResultRef, StatusView};
pub use store::{JobStore, LogAppender, Transition};
