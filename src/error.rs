use thiserror::Error;

use crate::protocol::RemoteError;

/// Main error type for the simulator control plane
#[derive(Error, Debug)]
pub enum SimulatorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid worker parameter: {0}")]
    InvalidParameter(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Address parsing error: {0}")]
    AddressParsing(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    // Routing errors
    #[error("No route to {0}")]
    UnknownRoute(String),

    // Transport errors
    #[error("Connection to {endpoint} failed after {attempts} attempts: {reason}")]
    ConnectionFailed {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Transport closed")]
    TransportClosed,

    // Reply correlation errors
    #[error("No reply from {target} within {timeout_ms}ms")]
    ReplyTimeout { target: String, timeout_ms: u64 },

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    // Worker supervision errors
    #[error("Worker creation failed on {agent}: {reason}")]
    WorkerCreation { agent: String, reason: String },

    #[error("Worker process error: {0}")]
    WorkerProcess(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Registry errors
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Not enough {worker_type} workers: requested {requested}, available {available}")]
    NotEnoughWorkers {
        worker_type: String,
        requested: usize,
        available: usize,
    },

    // Orchestration errors
    #[error("No reachable agents after {waited_secs}s")]
    NoReachableAgents { waited_secs: u64 },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for SimulatorError
pub type Result<T> = std::result::Result<T, SimulatorError>;
