//! The coordinator's directory of agents, workers and tests

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use super::data::{AgentData, Tags, TestData, TestStatus, TestSuite, WorkerData};
use super::query::{fair_sample, TargetType, WorkerQuery};
use crate::error::{Result, SimulatorError};
use crate::protocol::{AddressLevel, SimulatorAddress, WorkerParameters};

/// Concurrent directory of the fleet.
///
/// Index counters live here, so agent, worker and test indices are unique
/// per run and never reused. Iteration returns sorted snapshots.
#[derive(Default)]
pub struct ComponentRegistry {
    agents: DashMap<SimulatorAddress, AgentData>,
    workers: DashMap<SimulatorAddress, WorkerData>,
    tests: DashMap<u32, TestData>,
    last_agent_index: AtomicU32,
    last_test_index: AtomicU32,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Agents ====================

    pub fn add_agent(
        &self,
        public_address: impl Into<String>,
        private_address: impl Into<String>,
        tags: Tags,
    ) -> AgentData {
        let index = self.last_agent_index.fetch_add(1, Ordering::SeqCst) + 1;
        let agent = AgentData::new(
            SimulatorAddress::agent(index),
            public_address,
            private_address,
            tags,
        );
        debug!("Registered agent {} ({})", agent.address, agent.public_address);
        self.agents.insert(agent.address, agent.clone());
        agent
    }

    /// Remove an agent together with its workers
    pub fn remove_agent(&self, address: &SimulatorAddress) -> Option<AgentData> {
        let (_, agent) = self.agents.remove(address)?;
        for worker in &agent.workers {
            self.workers.remove(worker);
        }
        info!("Removed agent {} ({})", agent.address, agent.public_address);
        Some(agent)
    }

    pub fn get_agent(&self, address: &SimulatorAddress) -> Option<AgentData> {
        self.agents.get(address).map(|a| a.value().clone())
    }

    pub fn get_agent_by_public_address(&self, public_address: &str) -> Option<AgentData> {
        self.agents
            .iter()
            .find(|a| a.public_address == public_address)
            .map(|a| a.value().clone())
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn agents(&self) -> Vec<AgentData> {
        let mut agents: Vec<AgentData> = self.agents.iter().map(|a| a.value().clone()).collect();
        agents.sort_by_key(|a| a.address);
        agents
    }

    pub fn agent_addresses(&self) -> Vec<SimulatorAddress> {
        self.agents().into_iter().map(|a| a.address).collect()
    }

    // ==================== Workers ====================

    /// Allocate the address of the next worker on `agent`
    pub fn next_worker_address(&self, agent: &SimulatorAddress) -> Result<SimulatorAddress> {
        let mut entry = self
            .agents
            .get_mut(agent)
            .ok_or_else(|| SimulatorError::UnknownAgent(agent.to_string()))?;
        entry.last_worker_index += 1;
        Ok(SimulatorAddress::worker(
            agent.agent_index(),
            entry.last_worker_index,
        ))
    }

    /// Record a worker that was started and acknowledged
    pub fn add_worker(
        &self,
        address: SimulatorAddress,
        parameters: WorkerParameters,
        tags: Tags,
    ) -> Result<WorkerData> {
        if address.level() != AddressLevel::Worker {
            return Err(SimulatorError::Validation(format!(
                "{address} is not a worker address"
            )));
        }
        let agent_address = address
            .parent()
            .ok_or_else(|| SimulatorError::UnknownAgent(address.to_string()))?;
        let mut agent = self
            .agents
            .get_mut(&agent_address)
            .ok_or_else(|| SimulatorError::UnknownAgent(agent_address.to_string()))?;

        if !agent.workers.contains(&address) {
            agent.workers.push(address);
        }
        agent.last_worker_index = agent.last_worker_index.max(address.worker_index());

        let worker = WorkerData::new(address, parameters, tags);
        self.workers.insert(address, worker.clone());
        Ok(worker)
    }

    pub fn add_workers(
        &self,
        workers: impl IntoIterator<Item = (SimulatorAddress, WorkerParameters)>,
        tags: &Tags,
    ) -> Result<Vec<WorkerData>> {
        workers
            .into_iter()
            .map(|(address, parameters)| self.add_worker(address, parameters, tags.clone()))
            .collect()
    }

    pub fn remove_worker(&self, address: &SimulatorAddress) -> Option<WorkerData> {
        let (_, worker) = self.workers.remove(address)?;
        if let Some(agent_address) = address.parent() {
            if let Some(mut agent) = self.agents.get_mut(&agent_address) {
                agent.workers.retain(|w| w != address);
            }
        }
        debug!("Removed worker {}", address);
        Some(worker)
    }

    pub fn remove_all_workers(&self) -> usize {
        let removed = self.workers.len();
        self.workers.clear();
        for mut agent in self.agents.iter_mut() {
            agent.workers.clear();
        }
        removed
    }

    pub fn get_worker(&self, address: &SimulatorAddress) -> Option<WorkerData> {
        self.workers.get(address).map(|w| w.value().clone())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> Vec<WorkerData> {
        let mut workers: Vec<WorkerData> = self.workers.iter().map(|w| w.value().clone()).collect();
        workers.sort_by_key(|w| w.address);
        workers
    }

    pub fn workers_of(&self, agent: &SimulatorAddress) -> Vec<WorkerData> {
        self.workers()
            .into_iter()
            .filter(|w| w.agent_address().as_ref() == Some(agent))
            .collect()
    }

    /// Fair sample of `count` workers, see [`fair_sample`]
    pub fn get_workers(&self, target_type: TargetType, count: usize) -> Result<Vec<WorkerData>> {
        fair_sample(&self.workers(), target_type, count)
    }

    pub fn query(&self, query: &WorkerQuery) -> Vec<WorkerData> {
        query.execute(self.workers())
    }

    // ==================== Tests ====================

    pub fn add_tests(&self, suite: &TestSuite) -> Vec<TestData> {
        suite
            .tests
            .iter()
            .map(|case| {
                let index = self.last_test_index.fetch_add(1, Ordering::SeqCst) + 1;
                let test = TestData::new(index, case.clone());
                self.tests.insert(index, test.clone());
                test
            })
            .collect()
    }

    pub fn get_test(&self, test_index: u32) -> Option<TestData> {
        self.tests.get(&test_index).map(|t| t.value().clone())
    }

    pub fn get_test_by_id(&self, id: &str) -> Option<TestData> {
        self.tests.iter().find(|t| t.id() == id).map(|t| t.value().clone())
    }

    pub fn tests(&self) -> Vec<TestData> {
        let mut tests: Vec<TestData> = self.tests.iter().map(|t| t.value().clone()).collect();
        tests.sort_by_key(|t| t.test_index);
        tests
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    /// Apply a lifecycle transition; returns the previous status
    pub fn update_test_status(&self, test_index: u32, status: TestStatus) -> Result<TestStatus> {
        let mut test = self
            .tests
            .get_mut(&test_index)
            .ok_or_else(|| SimulatorError::Validation(format!("unknown test T{test_index}")))?;
        test.transition(status)
    }

    pub fn remove_tests(&self) {
        self.tests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerType;
    use crate::registry::TestCase;
    use std::sync::Arc;

    fn registry_with_agents(n: usize) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        for i in 0..n {
            registry.add_agent(format!("10.0.0.{}", i + 1), format!("192.168.0.{}", i + 1), Tags::new());
        }
        registry
    }

    fn add(registry: &ComponentRegistry, agent: u32, worker_type: WorkerType) -> SimulatorAddress {
        let address = registry.next_worker_address(&SimulatorAddress::agent(agent)).unwrap();
        registry
            .add_worker(address, WorkerParameters::new(worker_type), Tags::new())
            .unwrap();
        address
    }

    #[test]
    fn test_agent_indices_are_monotonic() {
        let registry = registry_with_agents(2);
        assert_eq!(registry.agent_addresses(), vec![SimulatorAddress::agent(1), SimulatorAddress::agent(2)]);

        registry.remove_agent(&SimulatorAddress::agent(2)).unwrap();
        let agent = registry.add_agent("10.0.0.9", "10.0.0.9", Tags::new());
        assert_eq!(agent.address, SimulatorAddress::agent(3));
        assert_eq!(
            registry.get_agent_by_public_address("10.0.0.9").unwrap().address,
            SimulatorAddress::agent(3)
        );
    }

    #[test]
    fn test_worker_indices_never_reused() {
        let registry = registry_with_agents(1);
        let first = add(&registry, 1, WorkerType::Member);
        assert_eq!(first.to_string(), "A1.W1");
        registry.remove_worker(&first).unwrap();

        let second = add(&registry, 1, WorkerType::Member);
        assert_eq!(second.to_string(), "A1.W2");
        assert_eq!(registry.get_agent(&SimulatorAddress::agent(1)).unwrap().workers, vec![second]);
    }

    #[test]
    fn test_worker_requires_known_agent() {
        let registry = registry_with_agents(1);
        assert!(matches!(
            registry.next_worker_address(&SimulatorAddress::agent(5)),
            Err(SimulatorError::UnknownAgent(_))
        ));
        assert!(registry
            .add_worker(SimulatorAddress::worker(5, 1), WorkerParameters::new(WorkerType::Client), Tags::new())
            .is_err());
        assert!(registry
            .add_worker(SimulatorAddress::agent(1), WorkerParameters::new(WorkerType::Client), Tags::new())
            .is_err());
    }

    #[test]
    fn test_remove_agent_drops_its_workers() {
        let registry = registry_with_agents(2);
        add(&registry, 1, WorkerType::Member);
        add(&registry, 2, WorkerType::Member);
        registry.remove_agent(&SimulatorAddress::agent(1));
        assert_eq!(registry.worker_count(), 1);
        assert_eq!(registry.remove_all_workers(), 1);
        assert!(registry.get_agent(&SimulatorAddress::agent(2)).unwrap().workers.is_empty());
    }

    #[test]
    fn test_get_workers_is_fair() {
        let registry = registry_with_agents(2);
        for agent in 1..=2 {
            for _ in 0..3 {
                add(&registry, agent, WorkerType::Member);
            }
        }
        let selected = registry.get_workers(TargetType::Member, 4).unwrap();
        let on_first = selected.iter().filter(|w| w.address.agent_index() == 1).count();
        assert_eq!(on_first, 2);
        assert!(registry.get_workers(TargetType::Member, 7).is_err());
    }

    #[test]
    fn test_tests_lifecycle_through_registry() {
        let registry = ComponentRegistry::new();
        let suite = TestSuite::new("suite")
            .with_test(TestCase::new("map"))
            .with_test(TestCase::new("queue"));
        let tests = registry.add_tests(&suite);
        assert_eq!(tests.iter().map(|t| t.test_index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(registry.get_test_by_id("queue").unwrap().test_index, 2);

        registry.update_test_status(1, TestStatus::Running).unwrap();
        assert!(registry.update_test_status(1, TestStatus::Completed).is_err());
        assert!(registry.update_test_status(9, TestStatus::Running).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_worker_allocation() {
        let registry = Arc::new(registry_with_agents(1));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.next_worker_address(&SimulatorAddress::agent(1)).unwrap()
            }));
        }
        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap());
        }
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 16);
    }
}
