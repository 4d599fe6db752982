//! Worker runtime: liveness, pings and graceful finish
//!
//! Runs inside a worker process (over TCP to its agent) or embedded in the
//! agent's process (over the bus). The workload itself is driven elsewhere;
//! this runtime only keeps the control plane informed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SimulatorError};
use crate::protocol::{
    Endpoint, FailureKind, FailureOperation, LogLevel, OperationProcessor, Promise, RemoteErrorKind,
    SimulatorAddress, SimulatorOperation, WorkerType,
};
use crate::transport::Transport;

pub const ENV_WORKER_ADDRESS: &str = "SIMULATOR_WORKER_ADDRESS";
pub const ENV_WORKER_TYPE: &str = "SIMULATOR_WORKER_TYPE";
pub const ENV_WORKER_DRIVER: &str = "SIMULATOR_WORKER_DRIVER";
pub const ENV_WORKER_OPTS: &str = "SIMULATOR_WORKER_OPTS";
pub const ENV_WORKER_HOME: &str = "SIMULATOR_WORKER_HOME";
pub const ENV_WORKER_CONFIG: &str = "SIMULATOR_WORKER_CONFIG";
pub const ENV_AGENT_ENDPOINT: &str = "SIMULATOR_AGENT_ENDPOINT";
pub const ENV_KEEP_ALIVE_SECS: &str = "SIMULATOR_KEEP_ALIVE_SECS";

/// What a worker process learns from its agent through the environment
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub address: SimulatorAddress,
    pub worker_type: WorkerType,
    pub agent_endpoint: String,
    pub keep_alive_interval: Duration,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        let address = required_env(ENV_WORKER_ADDRESS)?.parse()?;
        let worker_type = required_env(ENV_WORKER_TYPE)?.parse()?;
        let agent_endpoint = required_env(ENV_AGENT_ENDPOINT)?;
        let keep_alive_secs = match std::env::var(ENV_KEEP_ALIVE_SECS) {
            Ok(v) => v.parse().map_err(|_| {
                SimulatorError::Validation(format!("{ENV_KEEP_ALIVE_SECS}: '{v}' is not a number"))
            })?,
            Err(_) => 5,
        };
        Ok(Self {
            address,
            worker_type,
            agent_endpoint,
            keep_alive_interval: Duration::from_secs(keep_alive_secs),
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| SimulatorError::Validation(format!("{name} is not set")))
}

pub struct WorkerRuntime {
    address: SimulatorAddress,
    endpoint: Arc<Endpoint>,
    keep_alive_interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl WorkerRuntime {
    pub fn new(
        address: SimulatorAddress,
        transport: Arc<dyn Transport>,
        keep_alive_interval: Duration,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            address,
            endpoint: Endpoint::new(address, transport),
            keep_alive_interval,
            stop_tx,
        })
    }

    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    fn agent(&self) -> Result<SimulatorAddress> {
        self.address
            .parent()
            .ok_or_else(|| SimulatorError::AddressParsing(format!("{} has no agent", self.address)))
    }

    /// Subscribe to the transport and start the keep-alive loop.
    ///
    /// The worker is reachable when this returns; the handle completes once
    /// the worker has been told to stop.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let agent = self.agent()?;
        self.endpoint.attach(Arc::new(WorkerProcessor {
            runtime: self.clone(),
        }))?;
        info!("Worker {} started (agent {})", self.address, agent);

        let runtime = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.keep_alive_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = runtime.endpoint.fire(agent, SimulatorOperation::KeepAlive).await {
                            warn!("Worker {} keep-alive failed: {}", runtime.address, e);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            runtime.endpoint.transport().detach(runtime.address);
            info!("Worker {} stopped", runtime.address);
        }))
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Report an unrecoverable workload error to the agent
    pub async fn report_exception(&self, message: &str, test_id: Option<&str>, cause: Option<&str>) {
        let mut failure =
            FailureOperation::new(message, FailureKind::WorkerException).with_worker(self.address);
        if let Some(test_id) = test_id {
            failure = failure.with_test_id(test_id);
        }
        if let Some(cause) = cause {
            failure = failure.with_cause(cause);
        }
        self.send_failure(failure).await;
    }

    async fn send_failure(&self, failure: FailureOperation) {
        let agent = match self.agent() {
            Ok(agent) => agent,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        if let Err(e) = self.endpoint.fire(agent, SimulatorOperation::Failure(failure)).await {
            error!("Worker {} could not report failure: {}", self.address, e);
        }
    }
}

struct WorkerProcessor {
    runtime: Arc<WorkerRuntime>,
}

#[async_trait]
impl OperationProcessor for WorkerProcessor {
    async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, promise: Promise) {
        let runtime = &self.runtime;
        match operation {
            SimulatorOperation::Ping => {
                promise.ok(runtime.address.to_string()).await;
            }
            SimulatorOperation::TerminateWorker { poison_pill } => {
                if poison_pill {
                    let failure = FailureOperation::new("Worker finished", FailureKind::WorkerFinished)
                        .with_worker(runtime.address);
                    runtime.send_failure(failure).await;
                }
                info!("Worker {} terminating on request of {}", runtime.address, source);
                promise.ok("").await;
                runtime.stop();
            }
            SimulatorOperation::Log(log) => {
                match log.level {
                    LogLevel::Debug => debug!("[{}] {}", source, log.message),
                    LogLevel::Info => info!("[{}] {}", source, log.message),
                    LogLevel::Warn => warn!("[{}] {}", source, log.message),
                    LogLevel::Error => error!("[{}] {}", source, log.message),
                }
                promise.ok("").await;
            }
            other => {
                promise
                    .fail(
                        RemoteErrorKind::Unsupported,
                        format!("worker does not handle {}", other.operation_type()),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, OperationEnvelope};
    use crate::transport::{EnvelopeHandler, MessageBus};
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<OperationEnvelope>);

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, envelope: Envelope) {
            if let Envelope::Operation(op) = envelope {
                let _ = self.0.send(op);
            }
        }
    }

    struct Idle;

    #[async_trait]
    impl OperationProcessor for Idle {
        async fn process(&self, _source: SimulatorAddress, _operation: SimulatorOperation, _promise: Promise) {}
    }

    fn fleet() -> (Arc<MessageBus>, mpsc::UnboundedReceiver<OperationEnvelope>, Arc<Endpoint>) {
        let bus = MessageBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.on_receive(SimulatorAddress::agent(1), Arc::new(Recorder(tx)))
            .unwrap();
        let coordinator = Endpoint::new(SimulatorAddress::coordinator(), bus.clone());
        coordinator.attach(Arc::new(Idle)).unwrap();
        (bus, rx, coordinator)
    }

    #[tokio::test]
    async fn test_keep_alive_and_ping() {
        let (bus, mut agent_rx, coordinator) = fleet();
        let worker = WorkerRuntime::new(SimulatorAddress::worker(1, 1), bus.clone(), Duration::from_millis(20));
        let handle = worker.start().unwrap();

        let first = agent_rx.recv().await.unwrap();
        assert_eq!(first.decode().unwrap(), SimulatorOperation::KeepAlive);
        assert_eq!(first.source, SimulatorAddress::worker(1, 1));

        let pong = coordinator
            .invoke(SimulatorAddress::worker(1, 1), SimulatorOperation::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pong, "A1.W1");

        worker.stop();
        handle.await.unwrap();
        assert!(!bus.is_subscribed(&SimulatorAddress::worker(1, 1)));
    }

    #[tokio::test]
    async fn test_poison_pill_reports_finish_then_stops() {
        let (bus, mut agent_rx, coordinator) = fleet();
        let worker = WorkerRuntime::new(SimulatorAddress::worker(1, 2), bus.clone(), Duration::from_secs(3600));
        let handle = worker.start().unwrap();

        coordinator
            .fire(
                SimulatorAddress::worker(1, 2),
                SimulatorOperation::TerminateWorker { poison_pill: true },
            )
            .await
            .unwrap();
        handle.await.unwrap();
        assert!(worker.is_stopped());

        let finished = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let op = agent_rx.recv().await.unwrap();
                if let SimulatorOperation::Failure(f) = op.decode().unwrap() {
                    return f;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished.kind, FailureKind::WorkerFinished);
        assert_eq!(finished.worker_address, Some(SimulatorAddress::worker(1, 2)));
    }

    #[test]
    fn test_settings_require_address() {
        std::env::remove_var(ENV_WORKER_ADDRESS);
        assert!(WorkerSettings::from_env().is_err());
    }
}
