//! Failure reports sent from agents (and workers) to the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::address::SimulatorAddress;

/// Classification of a failure report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Worker process could not be started
    WorkerCreateError,
    /// Worker reported an unrecoverable error
    WorkerException,
    /// No keep-alive from the worker within the timeout
    WorkerTimeout,
    /// Worker ran out of memory
    WorkerOom,
    /// Worker process exited with a non-zero status
    WorkerExit,
    /// Worker finished intentionally (poison pill), not an error
    WorkerFinished,
}

impl FailureKind {
    /// Graceful completion marker: logged, never counted
    pub fn is_poison_pill(self) -> bool {
        matches!(self, FailureKind::WorkerFinished)
    }

    /// The worker is gone after a failure of this kind
    pub fn is_worker_terminal(self) -> bool {
        !matches!(self, FailureKind::WorkerException)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::WorkerCreateError => "WORKER_CREATE_ERROR",
            FailureKind::WorkerException => "WORKER_EXCEPTION",
            FailureKind::WorkerTimeout => "WORKER_TIMEOUT",
            FailureKind::WorkerOom => "WORKER_OOM",
            FailureKind::WorkerExit => "WORKER_EXIT",
            FailureKind::WorkerFinished => "WORKER_FINISHED",
        };
        write!(f, "{name}")
    }
}

/// A failure (or graceful completion) report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureOperation {
    pub message: String,
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_address: Option<SimulatorAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_address: Option<SimulatorAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FailureOperation {
    pub fn new(message: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            message: message.into(),
            kind,
            worker_address: None,
            agent_address: None,
            worker_id: None,
            test_id: None,
            cause: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the worker; the agent address is derived from it
    pub fn with_worker(mut self, worker: SimulatorAddress) -> Self {
        self.agent_address = worker.agent_address();
        self.worker_address = Some(worker);
        self
    }

    pub fn with_agent(mut self, agent: SimulatorAddress) -> Self {
        self.agent_address = Some(agent);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// One-line rendering for logs and the failure file
    pub fn summary(&self) -> String {
        let mut line = format!("[{}] {}", self.kind, self.message);
        if let Some(worker) = &self.worker_address {
            line.push_str(&format!(" worker={worker}"));
        } else if let Some(agent) = &self.agent_address {
            line.push_str(&format!(" agent={agent}"));
        }
        if let Some(test_id) = &self.test_id {
            line.push_str(&format!(" test={test_id}"));
        }
        if let Some(cause) = &self.cause {
            line.push_str(&format!(" cause={cause}"));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_pill_classification() {
        assert!(FailureKind::WorkerFinished.is_poison_pill());
        assert!(!FailureKind::WorkerTimeout.is_poison_pill());
        assert!(FailureKind::WorkerExit.is_worker_terminal());
        assert!(!FailureKind::WorkerException.is_worker_terminal());
    }

    #[test]
    fn test_worker_sets_agent_address() {
        let failure = FailureOperation::new("boom", FailureKind::WorkerException)
            .with_worker(SimulatorAddress::worker(4, 2))
            .with_test_id("map-test");

        assert_eq!(failure.agent_address, Some(SimulatorAddress::agent(4)));
        assert_eq!(
            failure.summary(),
            "[WORKER_EXCEPTION] boom worker=A4.W2 test=map-test"
        );
    }

    #[test]
    fn test_kind_wire_name() {
        let json = serde_json::to_string(&FailureKind::WorkerCreateError).unwrap();
        assert_eq!(json, "\"WORKER_CREATE_ERROR\"");
    }
}
