//! Control-plane protocol
//!
//! Addresses, operations, envelopes and reply correlation shared by the
//! coordinator, agents and workers. Transport-agnostic.

pub mod address;
pub mod endpoint;
pub mod failure;
pub mod operation;
pub mod parameters;
pub mod promise;

pub use address::{AddressLevel, SimulatorAddress, Target};
pub use endpoint::{Endpoint, OperationProcessor};
pub use failure::{FailureKind, FailureOperation};
pub use operation::{
    CreateWorkerOperation, Envelope, LogLevel, LogOperation, OperationEnvelope, OperationType,
    ReplyEnvelope, SimulatorOperation,
};
pub use parameters::{WorkerParameters, WorkerType};
pub use promise::{PendingReplies, Promise, RemoteError, RemoteErrorKind, Response, ResponseFuture};
