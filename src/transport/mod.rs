//! Addressed transports
//!
//! Two interchangeable implementations of [`Transport`]:
//! - [`MessageBus`]: shared in-process publish/subscribe bus, each subscriber filters by address
//! - [`TcpTransport`]: point-to-point connections with a JSON line codec and structural routing
//!
//! Both only hand a component envelopes whose target is its own address or a
//! selector that matches it.

pub mod bus;
pub mod codec;
pub mod router;
pub mod tcp;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{Envelope, SimulatorAddress};

pub use bus::MessageBus;
pub use codec::WireFrame;
pub use router::{Route, Router};
pub use tcp::{ConnectRetry, TcpTransport};

/// Receives envelopes delivered to one address
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Route an envelope towards its target. An exact target nobody serves is
    /// a routing error: logged, dropped and returned as `UnknownRoute`.
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Deliver envelopes addressed to `local` (or matching selectors) to `handler`
    fn on_receive(&self, local: SimulatorAddress, handler: Arc<dyn EnvelopeHandler>) -> Result<()>;

    /// Stop delivering to `local`
    fn detach(&self, local: SimulatorAddress);

    /// Make sure `address` is reachable, connecting to `endpoint` if needed
    async fn ensure_route(&self, _address: SimulatorAddress, _endpoint: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self);
}
