//! Operations and the envelopes that carry them
//!
//! The routing layer only looks at `source`, `target` and `correlation_id`.
//! The operation itself travels as an opaque JSON payload tagged with its
//! [`OperationType`].

use serde::{Deserialize, Serialize};
use std::fmt;

use super::address::{SimulatorAddress, Target};
use super::failure::FailureOperation;
use super::parameters::WorkerParameters;
use super::promise::{RemoteError, RemoteErrorKind, Response};
use crate::error::{Result, SimulatorError};

/// Wire tag of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Ping,
    KeepAlive,
    CreateWorker,
    StartTimeoutDetection,
    StopTimeoutDetection,
    TerminateWorkers,
    TerminateWorker,
    Failure,
    Log,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Request to start one worker on an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkerOperation {
    /// Address the coordinator's registry allocated for the new worker
    pub address: SimulatorAddress,
    pub parameters: WorkerParameters,
    /// Stagger before the agent starts the process
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Ask the receiver to write a line to its log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogOperation {
    pub level: LogLevel,
    pub message: String,
}

/// Every operation understood by coordinator, agents and workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatorOperation {
    /// No-op round trip used for connectivity probes
    Ping,
    /// Liveness signal from a worker to its agent
    KeepAlive,
    CreateWorker(CreateWorkerOperation),
    StartTimeoutDetection,
    StopTimeoutDetection,
    /// Agent: terminate every worker it supervises
    TerminateWorkers,
    /// Worker: stop; with `poison_pill` the worker reports a graceful finish first
    TerminateWorker { poison_pill: bool },
    Failure(FailureOperation),
    Log(LogOperation),
}

impl SimulatorOperation {
    pub fn operation_type(&self) -> OperationType {
        match self {
            SimulatorOperation::Ping => OperationType::Ping,
            SimulatorOperation::KeepAlive => OperationType::KeepAlive,
            SimulatorOperation::CreateWorker(_) => OperationType::CreateWorker,
            SimulatorOperation::StartTimeoutDetection => OperationType::StartTimeoutDetection,
            SimulatorOperation::StopTimeoutDetection => OperationType::StopTimeoutDetection,
            SimulatorOperation::TerminateWorkers => OperationType::TerminateWorkers,
            SimulatorOperation::TerminateWorker { .. } => OperationType::TerminateWorker,
            SimulatorOperation::Failure(_) => OperationType::Failure,
            SimulatorOperation::Log(_) => OperationType::Log,
        }
    }
}

/// Addressed operation on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub source: SimulatorAddress,
    pub target: Target,
    /// Absent for fire-and-forget operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    pub operation_type: OperationType,
    pub payload: String,
}

impl OperationEnvelope {
    pub fn new(
        source: SimulatorAddress,
        target: Target,
        correlation_id: Option<u64>,
        operation: &SimulatorOperation,
    ) -> Result<Self> {
        Ok(Self {
            source,
            target,
            correlation_id,
            operation_type: operation.operation_type(),
            payload: serde_json::to_string(operation)?,
        })
    }

    /// Decode the payload, checking it agrees with the envelope's type tag
    pub fn decode(&self) -> Result<SimulatorOperation> {
        let operation: SimulatorOperation = serde_json::from_str(&self.payload)?;
        if operation.operation_type() != self.operation_type {
            return Err(SimulatorError::Protocol(format!(
                "envelope tagged {} carries a {} payload",
                self.operation_type,
                operation.operation_type()
            )));
        }
        Ok(operation)
    }
}

/// Reply to an operation that carried a correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: u64,
    pub source: SimulatorAddress,
    /// Reply destination: the source of the original operation
    pub target: SimulatorAddress,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<RemoteErrorKind>,
    /// Result on success, error message on failure
    pub payload: String,
}

impl ReplyEnvelope {
    pub fn new(
        correlation_id: u64,
        source: SimulatorAddress,
        target: SimulatorAddress,
        response: Response,
    ) -> Self {
        match response {
            Ok(payload) => Self {
                correlation_id,
                source,
                target,
                error: false,
                error_kind: None,
                payload,
            },
            Err(err) => Self {
                correlation_id,
                source,
                target,
                error: true,
                error_kind: Some(err.kind),
                payload: err.message,
            },
        }
    }

    pub fn into_response(self) -> Response {
        if self.error {
            Err(RemoteError::new(
                self.error_kind.unwrap_or(RemoteErrorKind::Failed),
                self.payload,
            ))
        } else {
            Ok(self.payload)
        }
    }
}

/// Anything the transport moves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Operation(OperationEnvelope),
    Reply(ReplyEnvelope),
}

impl Envelope {
    pub fn target(&self) -> Target {
        match self {
            Envelope::Operation(op) => op.target,
            Envelope::Reply(reply) => Target::Address(reply.target),
        }
    }

    pub fn source(&self) -> SimulatorAddress {
        match self {
            Envelope::Operation(op) => op.source,
            Envelope::Reply(reply) => reply.source,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Operation(op) => write!(
                f,
                "{} {} -> {} (corr={:?})",
                op.operation_type, op.source, op.target, op.correlation_id
            ),
            Envelope::Reply(reply) => write!(
                f,
                "reply {} -> {} (corr={}, error={})",
                reply.source, reply.target, reply.correlation_id, reply.error
            ),
        }
    }
}
