//! Human-readable projection of the registry

use serde::Serialize;
use tabled::{Table, Tabled};
use tracing::info;

use super::components::ComponentRegistry;

#[derive(Debug, Serialize, Tabled)]
pub struct WorkerRow {
    pub agent: String,
    pub public_address: String,
    pub private_address: String,
    pub worker: String,
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Serialize, Tabled)]
pub struct TestRow {
    pub address: String,
    pub id: String,
    pub status: String,
}

pub fn worker_rows(registry: &ComponentRegistry) -> Vec<WorkerRow> {
    let mut rows = Vec::new();
    for agent in registry.agents() {
        let workers = registry.workers_of(&agent.address);
        if workers.is_empty() {
            rows.push(WorkerRow {
                agent: agent.address.to_string(),
                public_address: agent.public_address.clone(),
                private_address: agent.private_address.clone(),
                worker: "-".into(),
                kind: "-".into(),
                version: "-".into(),
            });
        }
        for worker in workers {
            rows.push(WorkerRow {
                agent: agent.address.to_string(),
                public_address: agent.public_address.clone(),
                private_address: agent.private_address.clone(),
                worker: worker.address.to_string(),
                kind: worker.worker_type().to_string(),
                version: worker.parameters.version.clone(),
            });
        }
    }
    rows
}

pub fn test_rows(registry: &ComponentRegistry) -> Vec<TestRow> {
    registry
        .tests()
        .into_iter()
        .map(|t| TestRow {
            address: t.address.to_string(),
            id: t.test_case.id.clone(),
            status: t.status.to_string(),
        })
        .collect()
}

/// Render agents, workers and tests as tables
pub fn render_layout(registry: &ComponentRegistry) -> String {
    let mut out = format!(
        "Cluster layout: {} agents, {} workers, {} tests\n",
        registry.agent_count(),
        registry.worker_count(),
        registry.test_count()
    );
    let workers = worker_rows(registry);
    if workers.is_empty() {
        out.push_str("(no agents)\n");
    } else {
        out.push_str(&Table::new(&workers).to_string());
        out.push('\n');
    }
    let tests = test_rows(registry);
    if !tests.is_empty() {
        out.push_str(&Table::new(&tests).to_string());
        out.push('\n');
    }
    out
}

pub fn print_layout(registry: &ComponentRegistry) {
    info!("{}", render_layout(registry));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SimulatorAddress, WorkerParameters, WorkerType};
    use crate::registry::{Tags, TestCase, TestSuite};

    #[test]
    fn test_layout_lists_every_component() {
        let registry = ComponentRegistry::new();
        registry.add_agent("10.0.0.1", "192.168.0.1", Tags::new());
        registry.add_agent("10.0.0.2", "192.168.0.2", Tags::new());
        let address = registry.next_worker_address(&SimulatorAddress::agent(1)).unwrap();
        registry
            .add_worker(address, WorkerParameters::new(WorkerType::Member).with_version("4.2"), Tags::new())
            .unwrap();
        registry.add_tests(&TestSuite::new("s").with_test(TestCase::new("map-test")));

        let rendered = render_layout(&registry);
        assert!(rendered.contains("2 agents, 1 workers, 1 tests"));
        assert!(rendered.contains("A1.W1"));
        assert!(rendered.contains("192.168.0.2"));
        assert!(rendered.contains("A*.W*.T1"));
        assert!(rendered.contains("map-test"));
        assert_eq!(worker_rows(&registry).len(), 2);
    }
}
