//! Worker failure classification and escalation to the coordinator

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::protocol::{Endpoint, FailureKind, FailureOperation, SimulatorAddress, SimulatorOperation};

use super::process::WorkerProcess;

pub struct FailureHandler {
    agent_address: SimulatorAddress,
    endpoint: Arc<Endpoint>,
    /// Genuine failures seen by this agent; poison pills are not counted
    failure_count: AtomicU64,
}

impl FailureHandler {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            agent_address: endpoint.address(),
            endpoint,
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Build a report for `worker` and escalate it
    pub async fn handle(
        &self,
        message: impl Into<String>,
        kind: FailureKind,
        worker: Option<&WorkerProcess>,
        test_id: Option<&str>,
        cause: Option<String>,
    ) -> FailureOperation {
        let mut failure = FailureOperation::new(message, kind).with_agent(self.agent_address);
        if let Some(worker) = worker {
            failure = failure
                .with_worker(worker.address())
                .with_worker_id(worker.worker_id());
        }
        if let Some(test_id) = test_id {
            failure = failure.with_test_id(test_id);
        }
        if let Some(cause) = cause {
            failure = failure.with_cause(cause);
        }
        self.escalate(failure.clone()).await;
        failure
    }

    /// Log, count and forward a report to the coordinator
    pub async fn escalate(&self, mut failure: FailureOperation) {
        if failure.agent_address.is_none() {
            failure.agent_address = Some(self.agent_address);
        }

        if failure.kind.is_poison_pill() {
            info!("Worker finished: {}", failure.summary());
        } else {
            let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
            error!("Failure #{} on {}: {}", count, self.agent_address, failure.summary());
        }

        if let Err(e) = self
            .endpoint
            .fire(SimulatorAddress::coordinator(), SimulatorOperation::Failure(failure))
            .await
        {
            warn!("{} could not forward failure to the coordinator: {}", self.agent_address, e);
        }
    }
}
