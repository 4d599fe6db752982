//! Ordered, staggered worker startup
//!
//! Members first: every member creation request must be acknowledged
//! (success or failure) before the first client request is sent. Requests to
//! different agents run concurrently; on one agent they are staggered by
//! `startup_delay × index`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::deployment::DeploymentPlan;
use crate::config::CoordinatorConfig;
use crate::error::{Result, SimulatorError};
use crate::protocol::{
    CreateWorkerOperation, Endpoint, SimulatorAddress, SimulatorOperation, Target, WorkerParameters,
    WorkerType,
};
use crate::registry::{ComponentRegistry, Tags, WorkerData};

#[derive(Debug, Clone)]
pub struct StartupSettings {
    /// Stagger between starts on one agent (default: 0)
    pub startup_delay: Duration,
    /// Acknowledgment timeout per worker, on top of its stagger (default: 120s)
    pub create_timeout: Duration,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            startup_delay: Duration::ZERO,
            create_timeout: Duration::from_secs(120),
        }
    }
}

impl StartupSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            startup_delay: Duration::from_millis(config.worker_startup_delay_ms),
            create_timeout: config.worker_create_timeout(),
        }
    }
}

/// A worker that could not be started
#[derive(Debug, Clone)]
pub struct StartFailure {
    pub agent: SimulatorAddress,
    pub worker: Option<SimulatorAddress>,
    pub worker_type: WorkerType,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub started: Vec<WorkerData>,
    pub failures: Vec<StartFailure>,
}

impl StartupReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// First failure as an error, if any
    pub fn ensure_success(&self) -> Result<()> {
        match self.failures.first() {
            None => Ok(()),
            Some(failure) => Err(SimulatorError::WorkerCreation {
                agent: failure.agent.to_string(),
                reason: format!(
                    "{} of {} workers failed to start, first: {}",
                    self.failures.len(),
                    self.failures.len() + self.started.len(),
                    failure.reason
                ),
            }),
        }
    }

    fn merge(&mut self, other: StartupReport) {
        self.started.extend(other.started);
        self.failures.extend(other.failures);
    }
}

/// Start every worker in `plan`, members before clients, then switch on
/// timeout detection fleet-wide.
pub async fn start_workers(
    endpoint: &Arc<Endpoint>,
    registry: &Arc<ComponentRegistry>,
    plan: &DeploymentPlan,
    settings: &StartupSettings,
    tags: &Tags,
) -> StartupReport {
    let (members, clients) = plan.partition();
    let mut report = StartupReport::default();

    if !members.is_empty() {
        info!("Starting {} member workers on {} agents", members.len(), members.agents().count());
        report.merge(create_batch(endpoint, registry, &members, settings, tags).await);
    }
    if !clients.is_empty() {
        info!("Starting {} client workers on {} agents", clients.len(), clients.agents().count());
        report.merge(create_batch(endpoint, registry, &clients, settings, tags).await);
    }

    if let Err(e) = endpoint
        .fire(Target::all_agents(), SimulatorOperation::StartTimeoutDetection)
        .await
    {
        warn!("Could not start timeout detection: {}", e);
    }

    if report.is_success() {
        info!("Started {} workers", report.started.len());
    } else {
        error!(
            "Started {} workers, {} failed",
            report.started.len(),
            report.failures.len()
        );
    }
    report
}

/// Dispatch every creation request of one batch in parallel and wait for all
async fn create_batch(
    endpoint: &Arc<Endpoint>,
    registry: &Arc<ComponentRegistry>,
    plan: &DeploymentPlan,
    settings: &StartupSettings,
    tags: &Tags,
) -> StartupReport {
    let mut tasks = JoinSet::new();
    for (agent, workers) in plan.iter() {
        for (index, parameters) in workers.iter().enumerate() {
            let delay = settings.startup_delay * index as u32;
            let endpoint = endpoint.clone();
            let registry = registry.clone();
            let timeout = settings.create_timeout + delay;
            let agent = *agent;
            let parameters = parameters.clone();
            let tags = tags.clone();
            tasks.spawn(async move {
                create_worker(&endpoint, &registry, agent, parameters, delay, timeout, tags).await
            });
        }
    }

    let mut report = StartupReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(worker)) => report.started.push(worker),
            Ok(Err(failure)) => {
                error!(
                    "Failed to create {} worker on {}: {}",
                    failure.worker_type, failure.agent, failure.reason
                );
                report.failures.push(failure);
            }
            Err(e) => error!("Worker creation task failed: {}", e),
        }
    }
    report.started.sort_by_key(|w| w.address);
    report
}

async fn create_worker(
    endpoint: &Endpoint,
    registry: &ComponentRegistry,
    agent: SimulatorAddress,
    parameters: WorkerParameters,
    delay: Duration,
    timeout: Duration,
    tags: Tags,
) -> std::result::Result<WorkerData, StartFailure> {
    let worker_type = parameters.worker_type;
    let fail = |worker: Option<SimulatorAddress>, reason: String| StartFailure {
        agent,
        worker,
        worker_type,
        reason,
    };

    let address = registry
        .next_worker_address(&agent)
        .map_err(|e| fail(None, e.to_string()))?;
    let operation = SimulatorOperation::CreateWorker(CreateWorkerOperation {
        address,
        parameters: parameters.clone(),
        delay_ms: delay.as_millis() as u64,
    });

    endpoint
        .invoke(agent, operation, timeout)
        .await
        .map_err(|e| fail(Some(address), e.to_string()))?;
    let worker = registry
        .add_worker(address, parameters, tags)
        .map_err(|e| fail(Some(address), e.to_string()))?;
    info!("Created {} worker {}", worker_type, address);
    Ok(worker)
}
