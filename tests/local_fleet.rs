use std::sync::Arc;
use std::time::Duration;

use simulator::agent::{Agent, AgentSettings, LaunchMode};
use simulator::coordinator::{Coordinator, CoordinatorSettings};
use simulator::protocol::{
    FailureKind, FailureOperation, SimulatorAddress, SimulatorOperation, Target, WorkerParameters,
    WorkerType,
};
use simulator::registry::{TargetType, Tags};
use simulator::transport::{MessageBus, Transport};
use simulator::Endpoint;
use tokio_test::assert_ok;

fn agent_settings() -> AgentSettings {
    AgentSettings {
        keep_alive_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(500),
        ..AgentSettings::default()
    }
}

async fn local_fleet(agents: u32) -> (Arc<MessageBus>, Arc<Coordinator>, Vec<Arc<Agent>>) {
    let bus = MessageBus::new();
    let coordinator = Coordinator::new(bus.clone(), CoordinatorSettings::default()).unwrap();
    let mut fleet = Vec::new();
    for index in 1..=agents {
        fleet.push(
            Agent::start(
                SimulatorAddress::agent(index),
                bus.clone(),
                LaunchMode::Embedded {
                    transport: bus.clone(),
                },
                agent_settings(),
            )
            .unwrap(),
        );
        coordinator
            .registry()
            .add_agent(format!("local-{index}"), format!("local-{index}"), Tags::new());
    }
    assert_ok!(coordinator.bootstrap().await);
    (bus, coordinator, fleet)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Deploy, finish with poison pills and tear down a whole in-process fleet.
#[tokio::test]
async fn embedded_run_from_bootstrap_to_teardown() {
    let (bus, coordinator, fleet) = local_fleet(2).await;

    let report = coordinator
        .deploy(
            3,
            1,
            &WorkerParameters::new(WorkerType::Member),
            &WorkerParameters::new(WorkerType::Client),
        )
        .await
        .unwrap();
    assert_ok!(report.ensure_success());
    assert_eq!(coordinator.registry().worker_count(), 4);
    assert_eq!(fleet[0].manager().len() + fleet[1].manager().len(), 4);
    assert!(fleet.iter().all(|a| a.is_detecting_timeouts()) || {
        eventually(|| fleet.iter().all(|a| a.is_detecting_timeouts())).await
    });

    let members = coordinator
        .registry()
        .get_workers(TargetType::Member, 2)
        .unwrap();
    assert_eq!(members.len(), 2);
    assert_ne!(members[0].agent_address(), members[1].agent_address());

    // Every worker answers a ping routed through the bus
    for worker in coordinator.registry().workers() {
        let pong = coordinator
            .endpoint()
            .invoke(worker.address, SimulatorOperation::Ping, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(pong, worker.address.to_string());
    }

    assert_ok!(coordinator.send_poison_pill(Target::all_workers()).await);
    assert!(
        eventually(|| coordinator.failure_collector().finished_count() == 4).await,
        "expected 4 finished reports, got {}",
        coordinator.failure_collector().finished_count()
    );
    assert_eq!(coordinator.failure_count(), 0);
    assert_eq!(coordinator.registry().worker_count(), 0);
    assert!(fleet.iter().all(|a| a.failure_count() == 0));

    coordinator.shutdown().await;
    coordinator.shutdown().await;
    for agent in &fleet {
        agent.shutdown().await;
        assert!(agent.manager().is_empty());
    }
    bus.close().await;
}

/// Worker exceptions are counted on the agent and on the coordinator; finishes are not.
#[tokio::test]
async fn failures_are_counted_end_to_end() {
    let (bus, coordinator, fleet) = local_fleet(1).await;
    let report = coordinator
        .deploy(
            1,
            0,
            &WorkerParameters::new(WorkerType::Member),
            &WorkerParameters::new(WorkerType::Client),
        )
        .await
        .unwrap();
    let worker = report.started[0].address;
    assert_eq!(worker, SimulatorAddress::worker(1, 1));

    // Reports as the worker would send them; W9 is not supervised by anyone
    let reporter = Endpoint::new(SimulatorAddress::worker(1, 9), bus.clone());
    for kind in [
        FailureKind::WorkerException,
        FailureKind::WorkerFinished,
        FailureKind::WorkerException,
    ] {
        reporter
            .fire(
                SimulatorAddress::agent(1),
                SimulatorOperation::Failure(
                    FailureOperation::new("from workload", kind).with_worker(worker),
                ),
            )
            .await
            .unwrap();
    }

    assert!(eventually(|| coordinator.failure_collector().failure_count() == 2
        && coordinator.failure_collector().finished_count() == 1)
    .await);
    assert_eq!(fleet[0].failure_count(), 2);

    let reports = coordinator.failure_collector().reports().await;
    assert!(reports
        .iter()
        .all(|r| r.agent_address == Some(SimulatorAddress::agent(1))));

    // The finish made the worker terminal for the registry
    assert!(coordinator.registry().get_worker(&worker).is_none());

    coordinator.shutdown().await;
    fleet[0].shutdown().await;
    bus.close().await;
}

/// Terminating workers empties every agent and the registry; doing it twice is harmless.
#[tokio::test]
async fn terminate_workers_twice() {
    let (bus, coordinator, fleet) = local_fleet(2).await;
    coordinator
        .deploy(
            2,
            2,
            &WorkerParameters::new(WorkerType::Member),
            &WorkerParameters::new(WorkerType::Client),
        )
        .await
        .unwrap();
    assert_eq!(coordinator.registry().worker_count(), 4);

    coordinator.terminate_workers().await;
    assert_eq!(coordinator.registry().worker_count(), 0);
    assert!(fleet.iter().all(|a| a.manager().is_empty()));
    assert!(fleet.iter().all(|a| !a.is_detecting_timeouts()) || {
        eventually(|| fleet.iter().all(|a| !a.is_detecting_timeouts())).await
    });
    for worker in 1..=2 {
        assert!(!bus.is_subscribed(&SimulatorAddress::worker(1, worker)));
    }

    coordinator.terminate_workers().await;
    assert_eq!(coordinator.registry().worker_count(), 0);

    // Nothing was counted as a failure during teardown
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.failure_count(), 0);

    coordinator.shutdown().await;
    for agent in &fleet {
        agent.shutdown().await;
    }
    bus.close().await;
}
