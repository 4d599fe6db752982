//! Coordinator: the single control process of a run
//!
//! Owns the registry, drives connectivity bootstrap and ordered worker
//! startup, collects failure reports and tears the fleet down again.

use async_trait::async_trait;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bootstrap::{bootstrap_connectivity, spawn_keep_alive, ConnectivityReport, ConnectivitySettings};
use super::deployment::DeploymentPlan;
use super::failure_collector::FailureCollector;
use super::startup::{start_workers, StartupReport, StartupSettings};
use crate::config::{AgentHostConfig, CoordinatorConfig};
use crate::error::Result;
use crate::protocol::{
    Endpoint, LogLevel, LogOperation, OperationProcessor, Promise, RemoteErrorKind,
    SimulatorAddress, SimulatorOperation, Target, WorkerParameters,
};
use crate::registry::{print_layout, AgentData, ComponentRegistry, Tags};
use crate::transport::Transport;

/// Worker tag carrying the run id
pub const RUN_TAG: &str = "run";

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub connectivity: ConnectivitySettings,
    pub startup: StartupSettings,
    /// Interval of the agent keep-alive probe (default: 10s)
    pub keep_alive_interval: Duration,
    /// Timeout of teardown round trips (default: 30s)
    pub operation_timeout: Duration,
    pub failure_file: Option<PathBuf>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            connectivity: ConnectivitySettings::default(),
            startup: StartupSettings::default(),
            keep_alive_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            failure_file: None,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            connectivity: ConnectivitySettings::from_config(config),
            startup: StartupSettings::from_config(config),
            keep_alive_interval: config.keep_alive_interval(),
            operation_timeout: config.operation_timeout(),
            failure_file: config.failure_file.clone(),
        }
    }
}

pub struct Coordinator {
    run_id: Uuid,
    endpoint: Arc<Endpoint>,
    registry: Arc<ComponentRegistry>,
    collector: Arc<FailureCollector>,
    settings: CoordinatorSettings,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    shutdown_requested: AtomicBool,
}

impl Coordinator {
    /// Subscribe the coordinator address on `transport`
    pub fn new(transport: Arc<dyn Transport>, settings: CoordinatorSettings) -> Result<Arc<Self>> {
        let registry = Arc::new(ComponentRegistry::new());
        let collector = Arc::new(FailureCollector::new(
            registry.clone(),
            settings.failure_file.clone(),
        ));
        let endpoint = Endpoint::new(SimulatorAddress::coordinator(), transport);
        endpoint.attach(Arc::new(CoordinatorProcessor {
            collector: collector.clone(),
        }))?;

        let run_id = Uuid::new_v4();
        info!("Coordinator started, run {}", run_id);

        Ok(Arc::new(Self {
            run_id,
            endpoint,
            registry,
            collector,
            settings,
            keep_alive: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
        }))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn failure_collector(&self) -> &Arc<FailureCollector> {
        &self.collector
    }

    pub fn failure_count(&self) -> u64 {
        self.collector.failure_count()
    }

    /// Register hosts in order; the first becomes A1
    pub fn register_agents(&self, hosts: &[AgentHostConfig]) -> Vec<AgentData> {
        hosts
            .iter()
            .map(|host| {
                self.registry.add_agent(
                    host.public_address.clone(),
                    host.private_address().to_string(),
                    host.tags.clone(),
                )
            })
            .collect()
    }

    /// Probe all agents, drop the unreachable ones and start the keep-alive
    pub async fn bootstrap(&self) -> Result<ConnectivityReport> {
        let report =
            bootstrap_connectivity(&self.endpoint, &self.registry, &self.settings.connectivity).await?;

        let mut keep_alive = self.keep_alive.lock().await;
        if keep_alive.is_none() {
            *keep_alive = Some(spawn_keep_alive(
                self.endpoint.clone(),
                self.registry.clone(),
                self.settings.keep_alive_interval,
                self.settings.connectivity.ping_timeout,
            ));
        }
        Ok(report)
    }

    /// Start the workers of `plan`, members first
    pub async fn create_workers(&self, plan: &DeploymentPlan, tags: &Tags) -> StartupReport {
        start_workers(&self.endpoint, &self.registry, plan, &self.settings.startup, tags).await
    }

    /// Round-robin `members` and `clients` over the reachable agents and start them
    pub async fn deploy(
        &self,
        members: usize,
        clients: usize,
        member_parameters: &WorkerParameters,
        client_parameters: &WorkerParameters,
    ) -> Result<StartupReport> {
        let plan = DeploymentPlan::round_robin(
            &self.registry,
            members,
            clients,
            member_parameters,
            client_parameters,
        )?;
        let tags = Tags::from([(RUN_TAG.to_string(), self.run_id.to_string())]);
        Ok(self.create_workers(&plan, &tags).await)
    }

    /// Ask every worker matching `target` to finish gracefully
    pub async fn send_poison_pill(&self, target: Target) -> Result<()> {
        info!("Sending poison pill to {}", target);
        self.endpoint
            .fire(target, SimulatorOperation::TerminateWorker { poison_pill: true })
            .await
    }

    /// Write a line into every agent's log
    pub async fn log_on_agents(&self, level: LogLevel, message: impl Into<String>) {
        let operation = SimulatorOperation::Log(LogOperation {
            level,
            message: message.into(),
        });
        if let Err(e) = self.endpoint.fire(Target::all_agents(), operation).await {
            warn!("Could not log on agents: {}", e);
        }
    }

    /// Stop timeout detection, terminate the workers of every agent and
    /// clear them from the registry
    pub async fn terminate_workers(&self) {
        if let Err(e) = self
            .endpoint
            .fire(Target::all_agents(), SimulatorOperation::StopTimeoutDetection)
            .await
        {
            warn!("Could not stop timeout detection: {}", e);
        }

        let agents = self.registry.agent_addresses();
        info!("Terminating workers on {} agents", agents.len());
        let timeout = self.settings.operation_timeout;
        let results = join_all(agents.iter().map(|agent| {
            self.endpoint
                .invoke(*agent, SimulatorOperation::TerminateWorkers, timeout)
        }))
        .await;
        for (agent, result) in agents.iter().zip(results) {
            if let Err(e) = result {
                error!("Agent {} did not terminate its workers: {}", agent, e);
            }
        }

        let removed = self.registry.remove_all_workers();
        info!("Terminated {} workers", removed);
    }

    pub fn print_layout(&self) {
        print_layout(&self.registry);
    }

    /// Tear the run down. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("Coordinator shutdown already requested");
            return;
        }
        info!("Coordinator shutting down");

        if let Some(keep_alive) = self.keep_alive.lock().await.take() {
            keep_alive.abort();
        }
        self.terminate_workers().await;
        self.endpoint.transport().detach(self.endpoint.address());

        let failures = self.collector.failure_count();
        if failures > 0 {
            error!("Run {} finished with {} failures", self.run_id, failures);
        } else {
            info!("Run {} finished without failures", self.run_id);
        }
    }
}

struct CoordinatorProcessor {
    collector: Arc<FailureCollector>,
}

#[async_trait]
impl OperationProcessor for CoordinatorProcessor {
    async fn process(&self, source: SimulatorAddress, operation: SimulatorOperation, promise: Promise) {
        match operation {
            SimulatorOperation::Failure(failure) => {
                self.collector.notify(failure).await;
            }
            SimulatorOperation::Ping => {
                promise.ok(SimulatorAddress::coordinator().to_string()).await;
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
                warn!("Coordinator got unexpected {} from {}", other.operation_type(), source);
                promise
                    .fail(
                        RemoteErrorKind::Unsupported,
                        format!("coordinator does not handle {}", other.operation_type()),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageBus;

    #[tokio::test]
    async fn test_register_agents_in_order() {
        let coordinator = Coordinator::new(MessageBus::new(), CoordinatorSettings::default()).unwrap();
        let hosts = vec![
            AgentHostConfig {
                public_address: "10.0.0.1:9000".into(),
                private_address: Some("192.168.0.1".into()),
                tags: Default::default(),
            },
            AgentHostConfig {
                public_address: "10.0.0.2:9000".into(),
                private_address: None,
                tags: Default::default(),
            },
        ];
        let agents = coordinator.register_agents(&hosts);
        assert_eq!(agents[0].address, SimulatorAddress::agent(1));
        assert_eq!(agents[0].private_address, "192.168.0.1");
        assert_eq!(agents[1].private_address, "10.0.0.2:9000");
        assert_eq!(
            coordinator
                .registry()
                .get_agent_by_public_address("10.0.0.2:9000")
                .map(|a| a.address),
            Some(SimulatorAddress::agent(2))
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_without_agents() {
        let bus = MessageBus::new();
        let coordinator = Coordinator::new(bus.clone(), CoordinatorSettings::default()).unwrap();
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(!bus.is_subscribed(&SimulatorAddress::coordinator()));
    }
}
