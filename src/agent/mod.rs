//! Agent: per-host worker supervision
//!
//! - Creates workers on request of the coordinator (as OS processes or embedded runtimes)
//! - Tracks keep-alives and reports silent or exited workers
//! - Forwards worker failures to the coordinator
//! - Stops all workers on shutdown

#[allow(clippy::module_inception)]
pub mod agent;
pub mod failure;
pub mod launcher;
pub mod manager;
pub mod process;
pub mod timeout;

pub use agent::{Agent, AgentSettings};
pub use failure::FailureHandler;
pub use launcher::{LaunchMode, WorkerProcessLauncher};
pub use manager::WorkerProcessManager;
pub use process::{ExitOutcome, WorkerProcess};
pub use timeout::{CheckReport, TimeoutDetectorConfig, WorkerTimeoutDetector};
