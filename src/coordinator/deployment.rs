//! Deployment plan: which workers go to which agent

use std::collections::BTreeMap;

use crate::error::{Result, SimulatorError};
use crate::protocol::{SimulatorAddress, WorkerParameters};
use crate::registry::ComponentRegistry;

/// Agent address → worker parameters to launch there, in launch order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentPlan {
    workers: BTreeMap<SimulatorAddress, Vec<WorkerParameters>>,
}

impl DeploymentPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, agent: SimulatorAddress, parameters: WorkerParameters) {
        self.workers.entry(agent).or_default().push(parameters);
    }

    /// Spread `members` then `clients` over the registered agents round-robin.
    ///
    /// Clients continue where members stopped, so a 3-agent fleet with 2
    /// members and 2 clients gets M,M,C on A1..A3 and C on A1.
    pub fn round_robin(
        registry: &ComponentRegistry,
        members: usize,
        clients: usize,
        member_parameters: &WorkerParameters,
        client_parameters: &WorkerParameters,
    ) -> Result<Self> {
        let agents = registry.agent_addresses();
        if agents.is_empty() && members + clients > 0 {
            return Err(SimulatorError::Validation(
                "cannot deploy workers without agents".into(),
            ));
        }

        let mut plan = Self::new();
        let templates = std::iter::repeat(member_parameters)
            .take(members)
            .chain(std::iter::repeat(client_parameters).take(clients));
        for (slot, parameters) in templates.enumerate() {
            plan.add(agents[slot % agents.len()], parameters.clone());
        }
        Ok(plan)
    }

    /// Split into (members, clients); lite members count as members
    pub fn partition(&self) -> (DeploymentPlan, DeploymentPlan) {
        let mut members = DeploymentPlan::new();
        let mut clients = DeploymentPlan::new();
        for (agent, workers) in &self.workers {
            for parameters in workers {
                if parameters.worker_type.is_member() {
                    members.add(*agent, parameters.clone());
                } else {
                    clients.add(*agent, parameters.clone());
                }
            }
        }
        (members, clients)
    }

    pub fn agents(&self) -> impl Iterator<Item = &SimulatorAddress> {
        self.workers.keys()
    }

    pub fn workers_of(&self, agent: &SimulatorAddress) -> &[WorkerParameters] {
        self.workers.get(agent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SimulatorAddress, &Vec<WorkerParameters>)> {
        self.workers.iter()
    }

    pub fn member_count(&self) -> usize {
        self.count(|p| p.worker_type.is_member())
    }

    pub fn client_count(&self) -> usize {
        self.count(|p| !p.worker_type.is_member())
    }

    pub fn len(&self) -> usize {
        self.workers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count(&self, pred: impl Fn(&WorkerParameters) -> bool) -> usize {
        self.workers.values().flatten().filter(|p| pred(p)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerType;
    use crate::registry::Tags;

    fn registry(agents: usize) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        for i in 0..agents {
            registry.add_agent(format!("10.0.0.{i}"), format!("10.0.0.{i}"), Tags::new());
        }
        registry
    }

    #[test]
    fn test_round_robin_continues_after_members() {
        let plan = DeploymentPlan::round_robin(
            &registry(3),
            2,
            2,
            &WorkerParameters::new(WorkerType::Member),
            &WorkerParameters::new(WorkerType::Client),
        )
        .unwrap();

        let types = |a| {
            plan.workers_of(&SimulatorAddress::agent(a))
                .iter()
                .map(|p| p.worker_type)
                .collect::<Vec<_>>()
        };
        assert_eq!(types(1), vec![WorkerType::Member, WorkerType::Client]);
        assert_eq!(types(2), vec![WorkerType::Member]);
        assert_eq!(types(3), vec![WorkerType::Client]);
        assert_eq!(plan.member_count(), 2);
        assert_eq!(plan.client_count(), 2);
    }

    #[test]
    fn test_partition_keeps_lite_members_with_members() {
        let mut plan = DeploymentPlan::new();
        plan.add(SimulatorAddress::agent(1), WorkerParameters::new(WorkerType::Client));
        plan.add(SimulatorAddress::agent(1), WorkerParameters::new(WorkerType::LiteMember));
        plan.add(SimulatorAddress::agent(2), WorkerParameters::new(WorkerType::Member));

        let (members, clients) = plan.partition();
        assert_eq!(members.len(), 2);
        assert_eq!(clients.len(), 1);
        assert_eq!(clients.workers_of(&SimulatorAddress::agent(2)).len(), 0);
    }

    #[test]
    fn test_no_agents_is_an_error() {
        let parameters = WorkerParameters::new(WorkerType::Member);
        assert!(DeploymentPlan::round_robin(&registry(0), 1, 0, &parameters, &parameters).is_err());
        assert!(DeploymentPlan::round_robin(&registry(0), 0, 0, &parameters, &parameters)
            .unwrap()
            .is_empty());
    }
}
