//! Connectivity bootstrap and agent keep-alive
//!
//! Every registered agent is probed with a `Ping` round trip. Unreachable
//! agents are retried at a fixed interval until the fleet-wide budget runs
//! out; whatever is still silent then is dropped from the registry.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{Result, SimulatorError};
use crate::protocol::{Endpoint, SimulatorAddress, SimulatorOperation};
use crate::registry::{AgentData, ComponentRegistry};

/// Consecutive keep-alive misses before the log level goes up
const KEEP_ALIVE_WARN_AFTER: u32 = 3;

#[derive(Debug, Clone)]
pub struct ConnectivitySettings {
    /// Interval between probe rounds (default: 5s)
    pub probe_interval: Duration,
    /// Fleet-wide budget (default: 60s)
    pub probe_timeout: Duration,
    /// Round-trip timeout of one probe (default: 5s)
    pub ping_timeout: Duration,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectivitySettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            ping_timeout: config.ping_timeout(),
        }
    }
}

/// Outcome of the bootstrap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityReport {
    pub reachable: Vec<SimulatorAddress>,
    pub dropped: Vec<SimulatorAddress>,
    pub rounds: u32,
}

/// One no-op round trip to `agent`, dialing it first if the transport needs to.
///
/// `timeout` bounds the dial and the ping together.
pub async fn probe_agent(endpoint: &Endpoint, agent: &AgentData, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let probe = async {
        endpoint
            .transport()
            .ensure_route(agent.address, &agent.public_address)
            .await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        endpoint
            .invoke(agent.address, SimulatorOperation::Ping, remaining)
            .await
            .map(|_| ())
    };
    match tokio::time::timeout_at(deadline, probe).await {
        Ok(result) => result,
        Err(_) => Err(SimulatorError::ReplyTimeout {
            target: agent.address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Probe every registered agent until all answer or the budget is spent.
///
/// Agents still unreachable at the deadline are removed from the registry.
/// Fails with [`SimulatorError::NoReachableAgents`] when none are left.
pub async fn bootstrap_connectivity(
    endpoint: &Endpoint,
    registry: &ComponentRegistry,
    settings: &ConnectivitySettings,
) -> Result<ConnectivityReport> {
    let started = Instant::now();
    let deadline = started + settings.probe_timeout;
    let mut pending = registry.agents();
    let mut report = ConnectivityReport::default();

    info!(
        "Checking connectivity of {} agents (interval {:?}, budget {:?})",
        pending.len(),
        settings.probe_interval,
        settings.probe_timeout
    );

    loop {
        report.rounds += 1;
        // No probe of this round may outlive the budget
        let timeout = settings
            .ping_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let results = join_all(
            pending
                .iter()
                .map(|agent| probe_agent(endpoint, agent, timeout)),
        )
        .await;

        let mut still_pending = Vec::new();
        for (agent, result) in pending.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!("Agent {} ({}) is reachable", agent.address, agent.public_address);
                    report.reachable.push(agent.address);
                }
                Err(e) => {
                    debug!(
                        "Agent {} ({}) not reachable yet: {}",
                        agent.address, agent.public_address, e
                    );
                    still_pending.push(agent);
                }
            }
        }
        pending = still_pending;

        let now = Instant::now();
        if pending.is_empty() || now >= deadline {
            break;
        }
        info!(
            "Waiting for {} agents ({}s left)",
            pending.len(),
            (deadline - now).as_secs()
        );
        tokio::time::sleep(settings.probe_interval.min(deadline - now)).await;
    }

    for agent in pending {
        warn!(
            "Agent {} ({}) unreachable after {:?}, dropping it",
            agent.address,
            agent.public_address,
            started.elapsed()
        );
        registry.remove_agent(&agent.address);
        report.dropped.push(agent.address);
    }
    report.reachable.sort();

    if report.reachable.is_empty() {
        error!("No reachable agents, cannot continue");
        return Err(SimulatorError::NoReachableAgents {
            waited_secs: started.elapsed().as_secs(),
        });
    }
    info!(
        "{} agents reachable, {} dropped",
        report.reachable.len(),
        report.dropped.len()
    );
    Ok(report)
}

/// Re-probe all registered agents every `interval` for the life of the run
pub fn spawn_keep_alive(
    endpoint: Arc<Endpoint>,
    registry: Arc<ComponentRegistry>,
    interval: Duration,
    ping_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut misses: HashMap<SimulatorAddress, u32> = HashMap::new();
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately; bootstrap has just probed everyone
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let agents = registry.agents();
            let results = join_all(
                agents
                    .iter()
                    .map(|agent| probe_agent(&endpoint, agent, ping_timeout)),
            )
            .await;

            for (agent, result) in agents.iter().zip(results) {
                match result {
                    Ok(()) => {
                        if let Some(missed) = misses.remove(&agent.address) {
                            info!("Agent {} is back after {} missed keep-alives", agent.address, missed);
                        }
                    }
                    Err(e) => {
                        let missed = misses.entry(agent.address).or_insert(0);
                        *missed += 1;
                        if *missed >= KEEP_ALIVE_WARN_AFTER {
                            warn!(
                                "Agent {} missed {} keep-alives: {}",
                                agent.address, missed, e
                            );
                        } else {
                            debug!("Agent {} keep-alive failed: {}", agent.address, e);
                        }
                    }
                }
            }
        }
    })
}
