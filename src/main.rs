use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use simulator::agent::{Agent, AgentSettings, LaunchMode};
use simulator::config::{AgentHostConfig, SimulatorConfig};
use simulator::coordinator::{Coordinator, CoordinatorSettings};
use simulator::logging::init_logging;
use simulator::protocol::{LogLevel, SimulatorAddress, Target, WorkerParameters, WorkerType};
use simulator::transport::{MessageBus, TcpTransport, Transport};
use simulator::worker::{WorkerRuntime, WorkerSettings};

#[derive(Parser)]
#[command(name = "simulator")]
#[command(version = "0.1.0")]
#[command(about = "Distributed test orchestration: coordinator, agents and workers", long_about = None)]
struct Cli {
    /// Config file path (TOML)
    #[arg(short, long, global = true, env = "SIMULATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a run over TCP: probe agents, start workers, wait, tear down
    Coordinator {
        /// Member workers in total (overrides config)
        #[arg(long)]
        members: Option<usize>,
        /// Client workers in total (overrides config)
        #[arg(long)]
        clients: Option<usize>,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Supervise workers on this host
    Agent {
        /// Agent index (overrides config)
        #[arg(long)]
        index: Option<u32>,
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Worker runtime; started by an agent, configured through the environment
    Worker,
    /// Whole fleet in this process over the in-process bus
    Local {
        #[arg(long, default_value = "2")]
        agents: u32,
        #[arg(long, default_value = "2")]
        members: usize,
        #[arg(long, default_value = "1")]
        clients: usize,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SimulatorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!("Invalid configuration: {}", problem);
        }
        bail!("{} configuration problems", problems.len());
    }

    match cli.command {
        Commands::Coordinator {
            members,
            clients,
            duration,
        } => run_coordinator(config, members, clients, duration).await,
        Commands::Agent { index, bind } => run_agent(config, index, bind).await,
        Commands::Worker => run_worker(config).await,
        Commands::Local {
            agents,
            members,
            clients,
            duration,
        } => run_local(config, agents, members, clients, duration).await,
    }
}

fn worker_parameters(config: &SimulatorConfig, worker_type: WorkerType) -> WorkerParameters {
    WorkerParameters::new(worker_type).with_version(config.coordinator.version.clone())
}

async fn run_coordinator(
    config: SimulatorConfig,
    members: Option<usize>,
    clients: Option<usize>,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    if config.coordinator.agents.is_empty() {
        bail!("no agents configured (coordinator.agents)");
    }
    let transport = TcpTransport::new(SimulatorAddress::coordinator(), config.transport.connect_retry());
    let coordinator = Coordinator::new(
        transport.clone(),
        CoordinatorSettings::from_config(&config.coordinator),
    )?;
    coordinator.register_agents(&config.coordinator.agents);

    let result = drive_run(
        &coordinator,
        &config,
        members.unwrap_or(config.coordinator.members),
        clients.unwrap_or(config.coordinator.clients),
        duration,
    )
    .await;

    coordinator.shutdown().await;
    transport.close().await;
    result
}

/// Bootstrap, deploy, wait; shared by `coordinator` and `local`
async fn drive_run(
    coordinator: &Arc<Coordinator>,
    config: &SimulatorConfig,
    members: usize,
    clients: usize,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    coordinator.bootstrap().await?;

    let report = coordinator
        .deploy(
            members,
            clients,
            &worker_parameters(config, WorkerType::Member),
            &worker_parameters(config, WorkerType::Client),
        )
        .await?;
    coordinator.print_layout();
    report.ensure_success()?;

    coordinator
        .log_on_agents(LogLevel::Info, format!("Run {} started", coordinator.run_id()))
        .await;
    wait_for_end(duration).await;
    coordinator
        .log_on_agents(LogLevel::Info, format!("Run {} stopping", coordinator.run_id()))
        .await;

    if let Err(e) = coordinator.send_poison_pill(Target::all_workers()).await {
        warn!("Could not send poison pill: {}", e);
    }
    // Let finished reports come in before teardown
    tokio::time::sleep(Duration::from_secs(1)).await;

    let failures = coordinator.failure_count();
    if failures > 0 {
        bail!("{} failures reported", failures);
    }
    Ok(())
}

async fn run_agent(config: SimulatorConfig, index: Option<u32>, bind: Option<String>) -> anyhow::Result<()> {
    let address = config.agent.address(index)?;
    let bind = bind.unwrap_or_else(|| config.agent.bind_address.clone());

    let transport = TcpTransport::new(address, config.transport.connect_retry());
    let bound = transport.bind(&bind).await?;
    let worker_endpoint = config
        .agent
        .worker_endpoint
        .clone()
        .unwrap_or_else(|| bound.to_string());
    info!("Agent {} listening on {} (workers dial {})", address, bound, worker_endpoint);

    let agent = Agent::start(
        address,
        transport.clone(),
        LaunchMode::Process {
            agent_endpoint: worker_endpoint,
        },
        AgentSettings::from_config(&config),
    )?;

    shutdown_signal().await;
    agent.shutdown().await;
    transport.close().await;
    Ok(())
}

async fn run_worker(config: SimulatorConfig) -> anyhow::Result<()> {
    let settings = WorkerSettings::from_env()?;
    let transport = TcpTransport::new(settings.address, config.transport.connect_retry());
    let agent = transport.connect(&settings.agent_endpoint).await?;
    info!("{} worker {} connected to {}", settings.worker_type, settings.address, agent);

    let runtime = WorkerRuntime::new(settings.address, transport.clone(), settings.keep_alive_interval);
    let mut handle = runtime.start()?;

    tokio::select! {
        _ = &mut handle => {}
        _ = shutdown_signal() => {
            runtime.stop();
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
    }
    transport.close().await;
    Ok(())
}

async fn run_local(
    config: SimulatorConfig,
    agents: u32,
    members: usize,
    clients: usize,
    duration: Option<u64>,
) -> anyhow::Result<()> {
    let bus = MessageBus::new();
    let coordinator = Coordinator::new(bus.clone(), CoordinatorSettings::from_config(&config.coordinator))?;

    let mut fleet = Vec::new();
    let mut hosts = Vec::new();
    for index in 1..=agents {
        fleet.push(Agent::start(
            SimulatorAddress::agent(index),
            bus.clone(),
            LaunchMode::Embedded {
                transport: bus.clone(),
            },
            AgentSettings::from_config(&config),
        )?);
        hosts.push(AgentHostConfig {
            public_address: format!("local-{index}"),
            private_address: None,
            tags: Default::default(),
        });
    }
    coordinator.register_agents(&hosts);

    let result = drive_run(&coordinator, &config, members, clients, duration).await;

    coordinator.shutdown().await;
    for agent in &fleet {
        agent.shutdown().await;
    }
    bus.close().await;
    result
}

async fn wait_for_end(duration: Option<u64>) {
    match duration {
        Some(secs) => {
            info!("Running for {}s", secs);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = shutdown_signal() => {}
            }
        }
        None => {
            info!("Running until Ctrl-C");
            shutdown_signal().await;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
