//! Video job orchestrator.
//!
//! Submits a video, receives an opaque task ID and polls the job's status on
//! a fixed interval until it is completed or failed:
//! - **Single job**: a new submission cancels the previous poll loop first
//! - **Sticky terminal state**: the result (or error) renders exactly once
//! - **Late responses**: discarded once the job is terminal or cancelled

mod poller;
mod runner;
mod types;

pub use runner::VideoOrchestrator;
pub use types::{JobGuard, JobPhase};
