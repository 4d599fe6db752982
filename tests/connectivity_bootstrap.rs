use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use simulator::coordinator::{ConnectivitySettings, Coordinator, CoordinatorSettings};
use simulator::protocol::{OperationProcessor, Promise, SimulatorAddress, SimulatorOperation};
use simulator::registry::Tags;
use simulator::transport::{ConnectRetry, MessageBus, TcpTransport, Transport};
use simulator::{Endpoint, SimulatorError};

struct Responsive;

#[async_trait]
impl OperationProcessor for Responsive {
    async fn process(&self, source: SimulatorAddress, _operation: SimulatorOperation, promise: Promise) {
        promise.ok(format!("hello {source}")).await;
    }
}

/// Subscribed but never answers: probes time out instead of failing fast
struct Mute;

#[async_trait]
impl OperationProcessor for Mute {
    async fn process(&self, _: SimulatorAddress, _: SimulatorOperation, _: Promise) {}
}

fn coordinator_with_agents(bus: &Arc<MessageBus>, agents: u32) -> Arc<Coordinator> {
    let coordinator = Coordinator::new(bus.clone(), CoordinatorSettings::default()).unwrap();
    for index in 1..=agents {
        coordinator
            .registry()
            .add_agent(format!("10.0.0.{index}:9000"), format!("10.0.0.{index}"), Tags::new());
    }
    coordinator
}

/// 5 agents, 2 never respond: after the 60s budget exactly those 2 are dropped.
#[tokio::test(start_paused = true)]
async fn unreachable_agents_are_dropped_after_budget() {
    let bus = MessageBus::new();
    let coordinator = coordinator_with_agents(&bus, 5);
    for index in [1, 2, 4] {
        Endpoint::new(SimulatorAddress::agent(index), bus.clone())
            .attach(Arc::new(Responsive))
            .unwrap();
    }
    // A5 is up but silent, A3 is not there at all
    Endpoint::new(SimulatorAddress::agent(5), bus.clone())
        .attach(Arc::new(Mute))
        .unwrap();

    let started = tokio::time::Instant::now();
    let report = coordinator.bootstrap().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        report.reachable,
        vec![
            SimulatorAddress::agent(1),
            SimulatorAddress::agent(2),
            SimulatorAddress::agent(4)
        ]
    );
    let mut dropped = report.dropped.clone();
    dropped.sort();
    assert_eq!(dropped, vec![SimulatorAddress::agent(3), SimulatorAddress::agent(5)]);
    assert_eq!(coordinator.registry().agent_count(), 3);
    assert!(
        elapsed >= Duration::from_secs(60),
        "gave up before the budget: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(75),
        "kept probing past the budget: {elapsed:?}"
    );
}

/// With no agent answering the bootstrap fails instead of continuing with an empty fleet.
#[tokio::test(start_paused = true)]
async fn no_reachable_agents_is_fatal() {
    let bus = MessageBus::new();
    let coordinator = coordinator_with_agents(&bus, 5);

    let err = coordinator.bootstrap().await.unwrap_err();
    assert!(
        matches!(err, SimulatorError::NoReachableAgents { waited_secs } if waited_secs >= 60),
        "unexpected error: {err}"
    );
    assert_eq!(coordinator.registry().agent_count(), 0);
}

/// Over TCP a host that accepts but never says hello and a host that refuses
/// connections are both dropped, and the bootstrap still ends on time.
#[tokio::test]
async fn tcp_bootstrap_stays_within_budget() {
    let agent = TcpTransport::new(SimulatorAddress::agent(1), ConnectRetry::default());
    let live = agent.bind("127.0.0.1:0").await.unwrap();
    Endpoint::new(SimulatorAddress::agent(1), agent.clone())
        .attach(Arc::new(Responsive))
        .unwrap();

    let silent_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = silent_listener.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent_listener.accept().await {
            held.push(stream);
        }
    });

    let refused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let transport = TcpTransport::new(SimulatorAddress::coordinator(), ConnectRetry::default());
    let budget = Duration::from_secs(2);
    let settings = CoordinatorSettings {
        connectivity: ConnectivitySettings {
            probe_interval: Duration::from_millis(200),
            probe_timeout: budget,
            ping_timeout: Duration::from_millis(500),
        },
        ..CoordinatorSettings::default()
    };
    let coordinator = Coordinator::new(transport.clone(), settings).unwrap();
    for endpoint in [live, silent, refused] {
        coordinator
            .registry()
            .add_agent(endpoint.to_string(), "127.0.0.1", Tags::new());
    }

    let started = std::time::Instant::now();
    let report = coordinator.bootstrap().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.reachable, vec![SimulatorAddress::agent(1)]);
    let mut dropped = report.dropped.clone();
    dropped.sort();
    assert_eq!(dropped, vec![SimulatorAddress::agent(2), SimulatorAddress::agent(3)]);
    assert_eq!(coordinator.registry().agent_count(), 1);
    assert!(
        elapsed < budget + Duration::from_secs(1),
        "kept probing past the budget: {elapsed:?}"
    );

    coordinator.shutdown().await;
    transport.close().await;
    agent.close().await;
    holder.abort();
}
