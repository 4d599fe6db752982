//! Agent component: one per host, supervises that host's workers

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::failure::FailureHandler;
use super::launcher::{LaunchMode, WorkerProcessLauncher};
use super::manager::WorkerProcessManager;
use super::timeout::{TimeoutDetectorConfig, WorkerTimeoutDetector};
use crate::config::SimulatorConfig;
use crate::error::Result;
use crate::protocol::{
    Endpoint, LogLevel, OperationProcessor, Promise, RemoteErrorKind, SimulatorAddress,
    SimulatorOperation,
};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub timeout: TimeoutDetectorConfig,
    pub shutdown_grace: Duration,
    pub keep_alive_interval: Duration,
    pub worker_home: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            timeout: TimeoutDetectorConfig::default(),
            shutdown_grace: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(5),
            worker_home: PathBuf::from("workers"),
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            timeout: TimeoutDetectorConfig {
                check_interval: Duration::from_secs(config.agent.check_interval_secs),
                threshold: Duration::from_secs(config.agent.timeout_threshold_secs),
            },
            shutdown_grace: Duration::from_secs(config.agent.shutdown_grace_secs),
            keep_alive_interval: config.worker.keep_alive_interval(),
            worker_home: config.agent.worker_home.clone(),
        }
    }
}

pub struct Agent {
    endpoint: Arc<Endpoint>,
    manager: Arc<WorkerProcessManager>,
    detector: Arc<WorkerTimeoutDetector>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown_requested: AtomicBool,
}

impl Agent {
    /// Build the agent, subscribe it to `transport` and start worker monitoring
    pub fn start(
        address: SimulatorAddress,
        transport: Arc<dyn Transport>,
        mode: LaunchMode,
        settings: AgentSettings,
    ) -> Result<Arc<Self>> {
        let endpoint = Endpoint::new(address, transport);
        let failure_handler = Arc::new(FailureHandler::new(endpoint.clone()));
        let launcher = WorkerProcessLauncher::new(
            address,
            mode,
            settings.worker_home.clone(),
            settings.keep_alive_interval,
        );
        let manager = Arc::new(WorkerProcessManager::new(
            endpoint.clone(),
            launcher,
            failure_handler.clone(),
            settings.shutdown_grace,
        ));
        let detector = Arc::new(WorkerTimeoutDetector::new(settings.timeout.clone(), manager.clone()));

        endpoint.attach(Arc::new(AgentProcessor {
            address,
            manager: manager.clone(),
            detector: detector.clone(),
            failure_handler,
        }))?;
        let monitor = detector.spawn();
        info!("Agent {} started", address);

        Ok(Arc::new(Self {
            endpoint,
            manager,
            detector,
            monitor: Mutex::new(Some(monitor)),
            shutdown_requested: AtomicBool::new(false),
        }))
    }

    pub fn address(&self) -> SimulatorAddress {
        self.endpoint.address()
    }

    pub fn manager(&self) -> &Arc<WorkerProcessManager> {
        &self.manager
    }

    pub fn failure_count(&self) -> u64 {
        self.manager.failure_handler().failure_count()
    }

    pub fn is_detecting_timeouts(&self) -> bool {
        self.detector.is_detecting()
    }

    /// Stop monitoring and workers, leave the transport. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("Agent {} shutdown already requested", self.address());
            return;
        }
        info!("Agent {} shutting down", self.address());

        self.detector.stop();
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
        self.manager.shutdown().await;
        self.endpoint.transport().detach(self.address());
        info!(
            "Agent {} stopped ({} failures reported)",
            self.address(),
            self.failure_count()
        );
    }
}

struct AgentProcessor {
    address: SimulatorAddress,
    manager: Arc<WorkerProcessManager>,
    detector: Arc<WorkerTimeoutDetector>,
    failure_handler: Arc<FailureHandler>,
}

#[async_trait]
impl OperationProcessor for AgentProcessor {
    async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, promise: Promise) {
        match operation {
            SimulatorOperation::Ping => {
                promise.ok(self.address.to_string()).await;
            }
            SimulatorOperation::KeepAlive => {
                if !self.manager.update_last_seen_timestamp(&source) {
                    debug!("{} got a keep-alive from unknown worker {}", self.address, source);
                }
            }
            SimulatorOperation::CreateWorker(create) => {
                debug!(
                    "{} creating {} worker {} (delay {}ms)",
                    self.address, create.parameters.worker_type, create.address, create.delay_ms
                );
                self.manager.launch(create, promise);
            }
            SimulatorOperation::StartTimeoutDetection => {
                self.detector.start_detection();
                promise.ok("").await;
            }
            SimulatorOperation::StopTimeoutDetection => {
                self.detector.stop_detection();
                promise.ok("").await;
            }
            SimulatorOperation::TerminateWorkers => {
                // Replies only after every worker is gone; keep the envelope loop free meanwhile
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    manager.shutdown().await;
                    promise.ok("").await;
                });
            }
            SimulatorOperation::Failure(failure) => {
                if failure.kind.is_worker_terminal() {
                    if let Some(process) = failure.worker_address.and_then(|w| self.manager.get(&w)) {
                        process.mark_stopping();
                    }
                }
                self.failure_handler.escalate(failure).await;
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
            other @ SimulatorOperation::TerminateWorker { .. } => {
                promise
                    .fail(
                        RemoteErrorKind::Unsupported,
                        format!("agent does not handle {}", other.operation_type()),
                    )
                    .await;
            }
        }
    }
}
