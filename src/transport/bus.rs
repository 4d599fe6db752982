//! In-process publish/subscribe bus
//!
//! Every envelope is published to every subscriber; each subscriber task keeps
//! only what its address accepts. Delivery per subscriber is in publish order.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EnvelopeHandler, Transport};
use crate::error::{Result, SimulatorError};
use crate::protocol::{Envelope, SimulatorAddress};

const DEFAULT_CAPACITY: usize = 1024;

pub struct MessageBus {
    tx: broadcast::Sender<Envelope>,
    subscribers: DashMap<SimulatorAddress, JoinHandle<()>>,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self {
            tx,
            subscribers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_subscribed(&self, address: &SimulatorAddress) -> bool {
        self.subscribers.contains_key(address)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl Transport for MessageBus {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SimulatorError::TransportClosed);
        }

        if let Some(address) = envelope.target().as_address() {
            if !self.subscribers.contains_key(&address) {
                warn!("Routing error: nobody listens on {}, dropping {}", address, envelope);
                return Err(SimulatorError::UnknownRoute(address.to_string()));
            }
        }

        // A selector with no matching subscriber is an empty broadcast, not an error
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn on_receive(&self, local: SimulatorAddress, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SimulatorError::TransportClosed);
        }
        if self.subscribers.contains_key(&local) {
            return Err(SimulatorError::Protocol(format!(
                "{local} is already subscribed to the bus"
            )));
        }

        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.target().accepts(&local) {
                            handler.handle(envelope).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} lagged behind the bus, {} envelopes lost", local, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Bus subscriber {} stopped", local);
        });

        self.subscribers.insert(local, task);
        Ok(())
    }

    fn detach(&self, local: SimulatorAddress) {
        if let Some((_, task)) = self.subscribers.remove(&local) {
            task.abort();
            debug!("Detached {} from the bus", local);
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let addresses: Vec<SimulatorAddress> =
            self.subscribers.iter().map(|entry| *entry.key()).collect();
        for address in addresses {
            self.detach(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OperationEnvelope, SimulatorOperation, Target};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, envelope: Envelope) {
            let _ = self.0.send(envelope);
        }
    }

    fn subscribe(bus: &MessageBus, address: SimulatorAddress) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.on_receive(address, Arc::new(Recorder(tx))).unwrap();
        rx
    }

    fn ping(target: Target) -> Envelope {
        Envelope::Operation(
            OperationEnvelope::new(
                SimulatorAddress::coordinator(),
                target,
                None,
                &SimulatorOperation::Ping,
            )
            .unwrap(),
        )
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_envelopes() {
        let bus = MessageBus::new();
        let mut agent1 = subscribe(&bus, SimulatorAddress::agent(1));
        let mut worker11 = subscribe(&bus, SimulatorAddress::worker(1, 1));
        let mut worker21 = subscribe(&bus, SimulatorAddress::worker(2, 1));

        bus.send(ping(SimulatorAddress::agent(1).into())).await.unwrap();
        bus.send(ping(Target::workers_of(1))).await.unwrap();
        bus.send(ping(Target::all_workers())).await.unwrap();

        assert_eq!(drain(&mut agent1).await.len(), 1);
        assert_eq!(drain(&mut worker11).await.len(), 2);
        let seen = drain(&mut worker21).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].target(), Target::all_workers());
    }

    #[tokio::test]
    async fn test_unknown_exact_target_is_routing_error() {
        let bus = MessageBus::new();
        let _agent = subscribe(&bus, SimulatorAddress::agent(1));

        let err = bus.send(ping(SimulatorAddress::agent(2).into())).await.unwrap_err();
        assert!(matches!(err, SimulatorError::UnknownRoute(_)));

        // Empty broadcast is fine
        bus.send(ping(Target::all_workers())).await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_and_close() {
        let bus = MessageBus::new();
        let _rx = subscribe(&bus, SimulatorAddress::agent(1));
        assert!(bus.on_receive(
            SimulatorAddress::agent(1),
            Arc::new(Recorder(mpsc::unbounded_channel().0))
        )
        .is_err());

        bus.detach(SimulatorAddress::agent(1));
        assert!(!bus.is_subscribed(&SimulatorAddress::agent(1)));

        bus.close().await;
        assert!(matches!(
            bus.send(ping(Target::all_agents())).await,
            Err(SimulatorError::TransportClosed)
        ));
    }
}
