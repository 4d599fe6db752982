//! Materialise worker parameters into a running worker

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::process::WorkerProcess;
use crate::error::{Result, SimulatorError};
use crate::protocol::{CreateWorkerOperation, SimulatorAddress, WorkerParameters};
use crate::transport::Transport;
use crate::worker::runtime::{
    ENV_AGENT_ENDPOINT, ENV_KEEP_ALIVE_SECS, ENV_WORKER_ADDRESS, ENV_WORKER_CONFIG, ENV_WORKER_DRIVER,
    ENV_WORKER_HOME, ENV_WORKER_OPTS, ENV_WORKER_TYPE,
};
use crate::worker::WorkerRuntime;

const CONFIG_FILE: &str = "worker.conf";
const STDOUT_FILE: &str = "worker.out";
const STDERR_FILE: &str = "worker.err";

/// Where workers run
#[derive(Clone)]
pub enum LaunchMode {
    /// Separate OS processes that dial `agent_endpoint`
    Process { agent_endpoint: String },
    /// Worker runtimes inside the agent's process, on the agent's transport
    Embedded { transport: Arc<dyn Transport> },
}

pub struct WorkerProcessLauncher {
    agent_address: SimulatorAddress,
    mode: LaunchMode,
    home_root: PathBuf,
    keep_alive_interval: Duration,
}

impl WorkerProcessLauncher {
    pub fn new(
        agent_address: SimulatorAddress,
        mode: LaunchMode,
        home_root: impl Into<PathBuf>,
        keep_alive_interval: Duration,
    ) -> Self {
        Self {
            agent_address,
            mode,
            home_root: home_root.into(),
            keep_alive_interval,
        }
    }

    pub fn home_of(&self, address: &SimulatorAddress) -> PathBuf {
        self.home_root.join(address.to_string())
    }

    /// Start the worker described by `operation`
    pub async fn launch(&self, operation: &CreateWorkerOperation) -> Result<WorkerProcess> {
        let address = operation.address;
        if address.parent() != Some(self.agent_address) {
            return Err(self.creation_error(format!(
                "{address} does not belong to agent {}",
                self.agent_address
            )));
        }

        match &self.mode {
            LaunchMode::Embedded { transport } => {
                let runtime = WorkerRuntime::new(address, transport.clone(), self.keep_alive_interval);
                let task = runtime.start()?;
                info!("Started embedded {} worker {}", operation.parameters.worker_type, address);
                Ok(WorkerProcess::embedded(address, operation.parameters.clone(), task))
            }
            LaunchMode::Process { agent_endpoint } => {
                let home = self.home_of(&address);
                tokio::fs::create_dir_all(&home).await?;
                let config_path = write_config(&home, &operation.parameters).await?;
                let mut command = self.build_command(
                    address,
                    &operation.parameters,
                    agent_endpoint,
                    &home,
                    config_path.as_deref(),
                )?;

                let child = command.spawn().map_err(|e| {
                    self.creation_error(format!("could not spawn {}: {e}", program_of(&operation.parameters)))
                })?;
                info!(
                    "Started {} worker {} (pid {:?}) in {}",
                    operation.parameters.worker_type,
                    address,
                    child.id(),
                    home.display()
                );
                Ok(WorkerProcess::os(
                    address,
                    operation.parameters.clone(),
                    child,
                    Some(home),
                    operation.parameters.command.is_empty(),
                ))
            }
        }
    }

    fn build_command(
        &self,
        address: SimulatorAddress,
        parameters: &WorkerParameters,
        agent_endpoint: &str,
        home: &Path,
        config_path: Option<&Path>,
    ) -> Result<Command> {
        let mut command = if parameters.command.is_empty() {
            let exe = std::env::current_exe()?;
            let mut command = Command::new(exe);
            command.arg("worker");
            command
        } else {
            Command::new(&parameters.command)
        };
        command.args(&parameters.args);

        command
            .current_dir(home)
            .env(ENV_WORKER_ADDRESS, address.to_string())
            .env(ENV_WORKER_TYPE, parameters.worker_type.to_string())
            .env(ENV_WORKER_DRIVER, &parameters.driver)
            .env(ENV_WORKER_OPTS, parameters.jvm_options.join(" "))
            .env(ENV_WORKER_HOME, home)
            .env(ENV_AGENT_ENDPOINT, agent_endpoint)
            .env(ENV_KEEP_ALIVE_SECS, self.keep_alive_interval.as_secs().max(1).to_string())
            .envs(&parameters.env);
        if let Some(config_path) = config_path {
            command.env(ENV_WORKER_CONFIG, config_path);
        }

        let stdout = std::fs::File::create(home.join(STDOUT_FILE))?;
        let stderr = std::fs::File::create(home.join(STDERR_FILE))?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        debug!("Worker {} command: {:?}", address, command);
        Ok(command)
    }

    fn creation_error(&self, reason: String) -> SimulatorError {
        SimulatorError::WorkerCreation {
            agent: self.agent_address.to_string(),
            reason,
        }
    }
}

fn program_of(parameters: &WorkerParameters) -> &str {
    if parameters.command.is_empty() {
        "simulator worker"
    } else {
        &parameters.command
    }
}

async fn write_config(home: &Path, parameters: &WorkerParameters) -> Result<Option<PathBuf>> {
    match &parameters.config {
        Some(content) => {
            let path = home.join(CONFIG_FILE);
            tokio::fs::write(&path, content).await?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}
