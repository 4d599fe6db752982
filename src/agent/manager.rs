//! Per-agent worker supervision: launch, liveness and shutdown

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::failure::FailureHandler;
use super::launcher::WorkerProcessLauncher;
use super::process::{ExitOutcome, WorkerProcess};
use crate::error::{Result, SimulatorError};
use crate::protocol::{
    CreateWorkerOperation, Endpoint, FailureKind, FailureOperation, Promise, RemoteErrorKind,
    SimulatorAddress, SimulatorOperation,
};

const STARTUP_POLL: Duration = Duration::from_millis(50);

pub struct WorkerProcessManager {
    agent_address: SimulatorAddress,
    launcher: WorkerProcessLauncher,
    processes: DashMap<SimulatorAddress, Arc<WorkerProcess>>,
    /// Addresses with a start in flight
    starting: DashSet<SimulatorAddress>,
    failure_handler: Arc<FailureHandler>,
    endpoint: Arc<Endpoint>,
    shutdown_grace: Duration,
}

impl WorkerProcessManager {
    pub fn new(
        endpoint: Arc<Endpoint>,
        launcher: WorkerProcessLauncher,
        failure_handler: Arc<FailureHandler>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            agent_address: endpoint.address(),
            launcher,
            processes: DashMap::new(),
            starting: DashSet::new(),
            failure_handler,
            endpoint,
            shutdown_grace,
        }
    }

    /// Schedule the worker start; `promise` is answered exactly once from the spawned task
    pub fn launch(self: &Arc<Self>, operation: CreateWorkerOperation, promise: Promise) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if operation.delay_ms > 0 {
                debug!("Delaying start of {} by {}ms", operation.address, operation.delay_ms);
                tokio::time::sleep(Duration::from_millis(operation.delay_ms)).await;
            }

            match manager.start_worker(&operation).await {
                Ok(()) => {
                    promise.ok(operation.address.to_string()).await;
                }
                Err(e) => {
                    let message = format!("Failed to start worker {}", operation.address);
                    let failure = FailureOperation::new(message, FailureKind::WorkerCreateError)
                        .with_worker(operation.address)
                        .with_cause(e.to_string());
                    manager.failure_handler.escalate(failure).await;
                    promise
                        .fail(RemoteErrorKind::WorkerCreateError, e.to_string())
                        .await;
                }
            }
        })
    }

    async fn start_worker(&self, operation: &CreateWorkerOperation) -> Result<()> {
        // The reservation is released only after the process is in the map
        if !self.starting.insert(operation.address) {
            return Err(SimulatorError::WorkerCreation {
                agent: self.agent_address.to_string(),
                reason: format!("{} is already starting", operation.address),
            });
        }
        let result = if self.processes.contains_key(&operation.address) {
            Err(SimulatorError::WorkerCreation {
                agent: self.agent_address.to_string(),
                reason: format!("{} is already running", operation.address),
            })
        } else {
            self.spawn_and_await(operation).await
        };
        self.starting.remove(&operation.address);
        result
    }

    async fn spawn_and_await(&self, operation: &CreateWorkerOperation) -> Result<()> {
        let process = Arc::new(self.launcher.launch(operation).await?);
        self.processes.insert(operation.address, process.clone());

        if process.speaks_protocol() {
            let timeout = Duration::from_secs(operation.parameters.startup_timeout_secs);
            if let Err(e) = self.await_startup(&process, timeout).await {
                self.processes.remove(&operation.address);
                if let Err(stop_err) = process.terminate(self.shutdown_grace).await {
                    warn!("Could not stop half-started worker {}: {}", operation.address, stop_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for the first keep-alive, failing early if the worker dies
    async fn await_startup(&self, process: &WorkerProcess, timeout: Duration) -> Result<()> {
        let started = tokio::time::timeout(timeout, async {
            loop {
                tokio::select! {
                    _ = process.wait_reported() => return Ok(()),
                    _ = tokio::time::sleep(STARTUP_POLL) => {
                        if let Some(outcome) = process.try_exit().await {
                            let reason = match outcome {
                                ExitOutcome::Success => "exited before reporting".to_string(),
                                ExitOutcome::Failed(reason) => reason,
                            };
                            return Err(reason);
                        }
                    }
                }
            }
        })
        .await;

        let reason = match started {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(reason)) => reason,
            Err(_) => format!("no keep-alive within {}s", timeout.as_secs()),
        };
        Err(SimulatorError::WorkerCreation {
            agent: self.agent_address.to_string(),
            reason: format!("{}: {}", process.address(), reason),
        })
    }

    /// Liveness signal from `address`; false for unknown workers
    pub fn update_last_seen_timestamp(&self, address: &SimulatorAddress) -> bool {
        match self.processes.get(address) {
            Some(process) => {
                process.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: &SimulatorAddress) -> Option<Arc<WorkerProcess>> {
        self.processes.get(address).map(|p| p.value().clone())
    }

    pub fn remove(&self, address: &SimulatorAddress) -> Option<Arc<WorkerProcess>> {
        self.processes.remove(address).map(|(_, p)| p)
    }

    /// Snapshot of supervised workers
    pub fn processes(&self) -> Vec<Arc<WorkerProcess>> {
        let mut processes: Vec<Arc<WorkerProcess>> =
            self.processes.iter().map(|p| p.value().clone()).collect();
        processes.sort_by_key(|p| p.address());
        processes
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn failure_handler(&self) -> &Arc<FailureHandler> {
        &self.failure_handler
    }

    /// Stop every worker in parallel; the map is empty afterwards. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let addresses: Vec<SimulatorAddress> = self.processes.iter().map(|p| *p.key()).collect();
        if addresses.is_empty() {
            debug!("{}: no workers to stop", self.agent_address);
            return;
        }
        info!("{} stopping {} workers", self.agent_address, addresses.len());

        let mut tasks = JoinSet::new();
        for address in addresses {
            let Some((_, process)) = self.processes.remove(&address) else {
                continue;
            };
            process.mark_stopping();
            if process.speaks_protocol() {
                let stop = SimulatorOperation::TerminateWorker { poison_pill: false };
                if let Err(e) = self.endpoint.fire(address, stop).await {
                    debug!("Worker {} did not get the stop request: {}", address, e);
                }
            }
            let grace = self.shutdown_grace;
            tasks.spawn(async move {
                if let Err(e) = process.terminate(grace).await {
                    error!("Failed to stop worker {}: {}", address, e);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker shutdown task failed: {}", e);
            }
        }
        info!("{} stopped all workers", self.agent_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::launcher::LaunchMode;
    use crate::protocol::{WorkerParameters, WorkerType};
    use crate::transport::MessageBus;

    fn manager(bus: Arc<MessageBus>) -> Arc<WorkerProcessManager> {
        let endpoint = Endpoint::new(SimulatorAddress::agent(1), bus.clone());
        let launcher = WorkerProcessLauncher::new(
            SimulatorAddress::agent(1),
            LaunchMode::Embedded { transport: bus },
            "unused",
            Duration::from_millis(50),
        );
        let failures = Arc::new(FailureHandler::new(endpoint.clone()));
        Arc::new(WorkerProcessManager::new(
            endpoint,
            launcher,
            failures,
            Duration::from_millis(200),
        ))
    }

    fn create(worker: u32) -> CreateWorkerOperation {
        CreateWorkerOperation {
            address: SimulatorAddress::worker(1, worker),
            parameters: WorkerParameters::new(WorkerType::Member),
            delay_ms: 0,
        }
    }

    /// Forward keep-alives to the manager the way the agent does
    struct KeepAliveSink(Arc<WorkerProcessManager>);

    #[async_trait::async_trait]
    impl crate::protocol::OperationProcessor for KeepAliveSink {
        async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, _promise: Promise) {
            if operation == SimulatorOperation::KeepAlive {
                self.0.update_last_seen_timestamp(&source);
            }
        }
    }

    #[tokio::test]
    async fn test_launch_answers_promise_once_started() {
        let bus = MessageBus::new();
        let manager = manager(bus.clone());
        Endpoint::new(SimulatorAddress::agent(1), bus.clone())
            .attach(Arc::new(KeepAliveSink(manager.clone())))
            .unwrap();

        let (promise, rx) = Promise::local();
        manager.launch(create(1), promise).await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), "A1.W1");
        assert_eq!(manager.len(), 1);
        assert!(manager.get(&SimulatorAddress::worker(1, 1)).unwrap().has_reported());
    }

    #[tokio::test]
    async fn test_duplicate_launch_is_create_error() {
        let bus = MessageBus::new();
        let manager = manager(bus.clone());
        Endpoint::new(SimulatorAddress::agent(1), bus.clone())
            .attach(Arc::new(KeepAliveSink(manager.clone())))
            .unwrap();

        let (first, rx) = Promise::local();
        manager.launch(create(1), first).await.unwrap();
        rx.await.unwrap().unwrap();

        let (second, rx) = Promise::local();
        manager.launch(create(1), second).await.unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::WorkerCreateError);
        assert_eq!(manager.failure_handler().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_launches_of_one_address_start_once() {
        let bus = MessageBus::new();
        let manager = manager(bus.clone());
        Endpoint::new(SimulatorAddress::agent(1), bus.clone())
            .attach(Arc::new(KeepAliveSink(manager.clone())))
            .unwrap();

        let (first, first_rx) = Promise::local();
        let (second, second_rx) = Promise::local();
        let a = manager.launch(create(1), first);
        let b = manager.launch(create(1), second);
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();

        let outcomes = [first_rx.await.unwrap(), second_rx.await.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        let err = outcomes.iter().find_map(|o| o.as_ref().err()).unwrap();
        assert_eq!(err.kind, RemoteErrorKind::WorkerCreateError);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_worker_keep_alive() {
        let manager = manager(MessageBus::new());
        assert!(!manager.update_last_seen_timestamp(&SimulatorAddress::worker(1, 9)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let bus = MessageBus::new();
        let manager = manager(bus.clone());
        Endpoint::new(SimulatorAddress::agent(1), bus.clone())
            .attach(Arc::new(KeepAliveSink(manager.clone())))
            .unwrap();

        for worker in 1..=3 {
            let (promise, rx) = Promise::local();
            manager.launch(create(worker), promise).await.unwrap();
            rx.await.unwrap().unwrap();
        }
        assert_eq!(manager.len(), 3);

        manager.shutdown().await;
        assert!(manager.is_empty());
        manager.shutdown().await;
        assert!(manager.is_empty());
        for worker in 1..=3 {
            assert!(!bus.is_subscribed(&SimulatorAddress::worker(1, worker)));
        }
    }
}
