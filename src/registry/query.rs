//! Worker selection: fair sampling by type and composable queries

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;

use super::data::WorkerData;
use crate::error::{Result, SimulatorError};
use crate::protocol::{SimulatorAddress, WorkerType};

/// Which workers a test or driver should run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    /// Members and lite members
    Member,
    Client,
    /// Clients if any exist, otherwise members
    PreferClient,
    All,
}

impl TargetType {
    pub fn matches(self, worker: &WorkerData) -> bool {
        match self {
            TargetType::Member => worker.is_member(),
            TargetType::Client => !worker.is_member(),
            TargetType::All => true,
            // Resolved against the whole population by `resolve`
            TargetType::PreferClient => !worker.is_member(),
        }
    }

    /// Turn `PreferClient` into `Client` or `Member` depending on what exists
    pub fn resolve(self, workers: &[WorkerData]) -> TargetType {
        match self {
            TargetType::PreferClient if workers.iter().any(|w| !w.is_member()) => TargetType::Client,
            TargetType::PreferClient => TargetType::Member,
            other => other,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Member => write!(f, "member"),
            TargetType::Client => write!(f, "client"),
            TargetType::PreferClient => write!(f, "prefer-client"),
            TargetType::All => write!(f, "any"),
        }
    }
}

/// Pick `count` workers of `target_type`, spread round-robin over agents.
///
/// No agent contributes more than `ceil(count / agents)` workers while the
/// other agents still have candidates left.
pub fn fair_sample(workers: &[WorkerData], target_type: TargetType, count: usize) -> Result<Vec<WorkerData>> {
    let resolved = target_type.resolve(workers);

    let mut per_agent: BTreeMap<SimulatorAddress, Vec<&WorkerData>> = BTreeMap::new();
    for worker in workers.iter().filter(|w| resolved.matches(w)) {
        if let Some(agent) = worker.agent_address() {
            per_agent.entry(agent).or_default().push(worker);
        }
    }
    for candidates in per_agent.values_mut() {
        candidates.sort_by_key(|w| w.address);
    }

    let available: usize = per_agent.values().map(Vec::len).sum();
    if available < count {
        return Err(SimulatorError::NotEnoughWorkers {
            worker_type: resolved.to_string(),
            requested: count,
            available,
        });
    }

    let mut selected = Vec::with_capacity(count);
    let mut round = 0;
    while selected.len() < count {
        for candidates in per_agent.values() {
            if selected.len() == count {
                break;
            }
            if let Some(worker) = candidates.get(round) {
                selected.push((*worker).clone());
            }
        }
        round += 1;
    }
    Ok(selected)
}

/// Filter pipeline over registered workers, applied filter -> shuffle -> limit
#[derive(Debug, Clone, Default)]
pub struct WorkerQuery {
    version: Option<String>,
    worker_addresses: Vec<SimulatorAddress>,
    agent_addresses: Vec<SimulatorAddress>,
    worker_type: Option<WorkerType>,
    random: bool,
    max_count: Option<usize>,
}

impl WorkerQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn worker_addresses(mut self, addresses: impl IntoIterator<Item = SimulatorAddress>) -> Self {
        self.worker_addresses = addresses.into_iter().collect();
        self
    }

    pub fn agent_addresses(mut self, addresses: impl IntoIterator<Item = SimulatorAddress>) -> Self {
        self.agent_addresses = addresses.into_iter().collect();
        self
    }

    pub fn worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = Some(worker_type);
        self
    }

    pub fn random(mut self, random: bool) -> Self {
        self.random = random;
        self
    }

    pub fn max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    fn matches(&self, worker: &WorkerData) -> bool {
        if let Some(version) = &self.version {
            if &worker.parameters.version != version {
                return false;
            }
        }
        if !self.worker_addresses.is_empty() && !self.worker_addresses.contains(&worker.address) {
            return false;
        }
        if !self.agent_addresses.is_empty() {
            match worker.agent_address() {
                Some(agent) if self.agent_addresses.contains(&agent) => {}
                _ => return false,
            }
        }
        if let Some(worker_type) = self.worker_type {
            if worker.worker_type() != worker_type {
                return false;
            }
        }
        true
    }

    pub fn execute(&self, workers: Vec<WorkerData>) -> Vec<WorkerData> {
        self.execute_with_rng(workers, &mut rand::thread_rng())
    }

    pub fn execute_with_rng<R: Rng + ?Sized>(&self, workers: Vec<WorkerData>, rng: &mut R) -> Vec<WorkerData> {
        let mut result: Vec<WorkerData> = workers.into_iter().filter(|w| self.matches(w)).collect();
        if self.random {
            result.shuffle(rng);
        }
        if let Some(max) = self.max_count {
            result.truncate(max);
        }
        result
    }
}
