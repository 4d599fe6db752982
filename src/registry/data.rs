//! Registry records: agents, workers and tests

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SimulatorError};
use crate::protocol::{SimulatorAddress, Target, WorkerParameters, WorkerType};

pub type Tags = BTreeMap<String, String>;

/// One host running an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    pub address: SimulatorAddress,
    /// Address the coordinator uses for control traffic
    pub public_address: String,
    /// Address workers use for data-plane traffic
    pub private_address: String,
    #[serde(default)]
    pub tags: Tags,
    /// Workers hosted by this agent, in creation order
    #[serde(default)]
    pub workers: Vec<SimulatorAddress>,
    /// Last worker index handed out; indices are never reused
    #[serde(skip)]
    pub(crate) last_worker_index: u32,
}

impl AgentData {
    pub fn new(
        address: SimulatorAddress,
        public_address: impl Into<String>,
        private_address: impl Into<String>,
        tags: Tags,
    ) -> Self {
        Self {
            address,
            public_address: public_address.into(),
            private_address: private_address.into(),
            tags,
            workers: Vec::new(),
            last_worker_index: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.address.agent_index()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// A worker that was started and acknowledged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerData {
    pub address: SimulatorAddress,
    pub parameters: WorkerParameters,
    #[serde(default)]
    pub tags: Tags,
}

impl WorkerData {
    pub fn new(address: SimulatorAddress, parameters: WorkerParameters, tags: Tags) -> Self {
        Self {
            address,
            parameters,
            tags,
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.parameters.worker_type
    }

    pub fn is_member(&self) -> bool {
        self.worker_type().is_member()
    }

    pub fn agent_address(&self) -> Option<SimulatorAddress> {
        self.address.parent()
    }
}

/// Run lifecycle of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Queued,
    Running,
    Verifying,
    Completed,
    Failed,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Completed | TestStatus::Failed)
    }

    pub fn can_transition_to(self, next: TestStatus) -> bool {
        use TestStatus::*;
        match (self, next) {
            (Queued, Running) | (Running, Verifying) | (Verifying, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Queued => write!(f, "queued"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Verifying => write!(f, "verifying"),
            TestStatus::Completed => write!(f, "completed"),
            TestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A test as configured by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub tests: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tests: Vec::new(),
        }
    }

    pub fn with_test(mut self, test: TestCase) -> Self {
        self.tests.push(test);
        self
    }
}

/// A registered test; it runs on every worker under `A*.W*.T<index>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestData {
    pub test_index: u32,
    pub address: Target,
    pub test_case: TestCase,
    pub status: TestStatus,
}

impl TestData {
    pub fn new(test_index: u32, test_case: TestCase) -> Self {
        Self {
            test_index,
            address: Target::test_on_all_workers(test_index),
            test_case,
            status: TestStatus::Queued,
        }
    }

    pub fn id(&self) -> &str {
        &self.test_case.id
    }

    /// Move to `next`; returns the previous status
    pub fn transition(&mut self, next: TestStatus) -> Result<TestStatus> {
        if !self.status.can_transition_to(next) {
            return Err(SimulatorError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.status;
        self.status = next;
        Ok(previous)
    }
}
