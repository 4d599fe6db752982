//! Component endpoint: one address, one transport subscription, one reply table

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::address::{SimulatorAddress, Target};
use super::operation::{Envelope, OperationEnvelope, SimulatorOperation};
use super::promise::{PendingReplies, Promise, RemoteErrorKind, ResponseFuture};
use crate::error::Result;
use crate::transport::{EnvelopeHandler, Transport};

/// Component-side handler for incoming operations.
///
/// Implementations must not wait on round trips of their own inside
/// `process`: the transport delivers a component's envelopes one at a time,
/// so the reply would never be delivered. Spawn a task instead.
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, promise: Promise);
}

/// Addressed send/receive surface shared by coordinator, agents and workers
pub struct Endpoint {
    address: SimulatorAddress,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
}

impl Endpoint {
    pub fn new(address: SimulatorAddress, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            address,
            transport,
            pending: Arc::new(PendingReplies::new()),
        })
    }

    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Subscribe to operations for this address and dispatch them to `processor`
    pub fn attach(&self, processor: Arc<dyn OperationProcessor>) -> Result<()> {
        let handler = Arc::new(EndpointHandler {
            address: self.address,
            transport: self.transport.clone(),
            pending: self.pending.clone(),
            processor,
        });
        self.transport.on_receive(self.address, handler)
    }

    /// Send an operation that expects a reply
    pub async fn submit(
        &self,
        target: SimulatorAddress,
        operation: SimulatorOperation,
    ) -> Result<ResponseFuture> {
        let future = self.pending.register(target.into());
        let correlation_id = future.correlation_id();

        let sent = match OperationEnvelope::new(
            self.address,
            target.into(),
            Some(correlation_id),
            &operation,
        ) {
            Ok(envelope) => self.transport.send(Envelope::Operation(envelope)).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => Ok(future),
            Err(e) => {
                self.pending.cancel(correlation_id);
                Err(e)
            }
        }
    }

    /// Round trip with an explicit timeout
    pub async fn invoke(
        &self,
        target: SimulatorAddress,
        operation: SimulatorOperation,
        timeout: Duration,
    ) -> Result<String> {
        self.submit(target, operation).await?.get(timeout).await
    }

    /// Fire-and-forget send to an address or selector
    pub async fn fire(&self, target: impl Into<Target>, operation: SimulatorOperation) -> Result<()> {
        let envelope = OperationEnvelope::new(self.address, target.into(), None, &operation)?;
        self.transport.send(Envelope::Operation(envelope)).await
    }

    /// Outstanding round trips
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

struct EndpointHandler {
    address: SimulatorAddress,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
    processor: Arc<dyn OperationProcessor>,
}

#[async_trait]
impl EnvelopeHandler for EndpointHandler {
    async fn handle(&self, envelope: Envelope) {
        match envelope {
            Envelope::Reply(reply) => {
                self.pending.complete(reply);
            }
            Envelope::Operation(op) => {
                let promise = Promise::for_envelope(&op, self.address, self.transport.clone());
                match op.decode() {
                    Ok(operation) => {
                        debug!("{} processing {} from {}", self.address, op.operation_type, op.source);
                        self.processor.process(op.source, operation, promise).await;
                    }
                    Err(e) => {
                        warn!("{} could not decode operation from {}: {}", self.address, op.source, e);
                        promise.fail(RemoteErrorKind::Failed, e.to_string()).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimulatorError;
    use crate::protocol::RemoteError;
    use crate::transport::MessageBus;

    struct Echo;

    #[async_trait]
    impl OperationProcessor for Echo {
        async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, promise: Promise) {
            match operation {
                SimulatorOperation::Ping => {
                    promise.ok(format!("pong to {source}")).await;
                }
                _ => {
                    promise.fail(RemoteErrorKind::Unsupported, "echo only answers pings").await;
                }
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl OperationProcessor for Silent {
        async fn process(&self, _: SimulatorAddress, _: SimulatorOperation, _: Promise) {}
    }

    #[tokio::test]
    async fn test_round_trip_over_bus() {
        let bus = MessageBus::new();
        let coordinator = Endpoint::new(SimulatorAddress::coordinator(), bus.clone());
        coordinator.attach(Arc::new(Silent)).unwrap();
        let agent = Endpoint::new(SimulatorAddress::agent(1), bus.clone());
        agent.attach(Arc::new(Echo)).unwrap();

        let reply = coordinator
            .invoke(SimulatorAddress::agent(1), SimulatorOperation::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "pong to C");
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_is_tagged() {
        let bus = MessageBus::new();
        let coordinator = Endpoint::new(SimulatorAddress::coordinator(), bus.clone());
        coordinator.attach(Arc::new(Silent)).unwrap();
        let agent = Endpoint::new(SimulatorAddress::agent(1), bus.clone());
        agent.attach(Arc::new(Echo)).unwrap();

        let err = coordinator
            .invoke(SimulatorAddress::agent(1), SimulatorOperation::KeepAlive, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SimulatorError::Remote(RemoteError { kind, .. }) => {
                assert_eq!(kind, RemoteErrorKind::Unsupported)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_target_fails_fast() {
        let bus = MessageBus::new();
        let coordinator = Endpoint::new(SimulatorAddress::coordinator(), bus.clone());
        coordinator.attach(Arc::new(Silent)).unwrap();

        let err = coordinator
            .submit(SimulatorAddress::agent(9), SimulatorOperation::Ping)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SimulatorError::UnknownRoute(_)));
        assert_eq!(coordinator.pending_count(), 0);
    }
}
