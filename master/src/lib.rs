pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod failover;
pub mod handlers;
pub mod monitor;
pub mod state;
pub mod submit;

pub use cancel::CancelOutcome;
pub use config::Config;
pub use failover::SweepReport;
pub use handlers::build_router;
pub use state::{AppState, Orchestrator};
pub use submit::UploadedNetwork;
