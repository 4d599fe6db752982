use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{AddressLevel, SimulatorAddress};
use crate::transport::ConnectRetry;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One agent host as known to the coordinator
#[derive(Debug, Clone, Deserialize)]
pub struct AgentHostConfig {
    /// Address the coordinator dials (host:port)
    pub public_address: String,
    /// Address used for data-plane traffic; defaults to the public one
    #[serde(default)]
    pub private_address: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl AgentHostConfig {
    pub fn private_address(&self) -> &str {
        self.private_address.as_deref().unwrap_or(&self.public_address)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Agents in index order: the first entry is A1
    pub agents: Vec<AgentHostConfig>,
    /// Interval between connectivity probes of unreachable agents (default: 5s)
    pub probe_interval_secs: u64,
    /// Fleet-wide connectivity budget (default: 60s)
    pub probe_timeout_secs: u64,
    /// Round-trip timeout of a single probe (default: 5000ms)
    pub ping_timeout_ms: u64,
    /// Interval of the background keep-alive probe (default: 10s)
    pub keep_alive_interval_secs: u64,
    /// Stagger between worker starts on the same agent (default: 0)
    pub worker_startup_delay_ms: u64,
    /// Timeout waiting for a worker creation acknowledgment (default: 120s)
    pub worker_create_timeout_secs: u64,
    /// Timeout of other round trips (terminate, detection toggles) (default: 30s)
    pub operation_timeout_secs: u64,
    /// Append one line per failure report
    pub failure_file: Option<PathBuf>,
    /// Deployment: member workers in total
    pub members: usize,
    /// Deployment: client workers in total
    pub clients: usize,
    /// Version tag stamped on every deployed worker
    pub version: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            probe_interval_secs: 5,
            probe_timeout_secs: 60,
            ping_timeout_ms: 5000,
            keep_alive_interval_secs: 10,
            worker_startup_delay_ms: 0,
            worker_create_timeout_secs: 120,
            operation_timeout_secs: 30,
            failure_file: None,
            members: 1,
            clients: 0,
            version: String::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn worker_create_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_create_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// This agent's index (A<index>)
    pub index: u32,
    /// Listen address for the coordinator and workers
    pub bind_address: String,
    /// Address workers dial; defaults to the bound address
    pub worker_endpoint: Option<String>,
    /// Root of per-worker home directories
    pub worker_home: PathBuf,
    /// Missing keep-alives for this long is a WORKER_TIMEOUT (default: 60s)
    pub timeout_threshold_secs: u64,
    /// Exit and timeout check interval (default: 1s)
    pub check_interval_secs: u64,
    /// Grace between SIGTERM and SIGKILL on shutdown (default: 10s)
    pub shutdown_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            index: 1,
            bind_address: "0.0.0.0:9000".to_string(),
            worker_endpoint: None,
            worker_home: PathBuf::from("workers"),
            timeout_threshold_secs: 60,
            check_interval_secs: 1,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Connection attempts before giving up (default: 5)
    pub connect_attempts: u32,
    /// Delay between attempts (default: 1000ms)
    pub connect_delay_ms: u64,
    /// Consecutive failures after which attempts log at warn (default: 3)
    pub connect_warn_after: u32,
    /// Bound on one TCP connect attempt (default: 5000ms)
    pub connect_timeout_ms: u64,
    /// Bound on the hello exchange of a new connection (default: 10000ms)
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            connect_delay_ms: 1000,
            connect_warn_after: 3,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl AgentConfig {
    /// This agent's address, with an optional index override from the command line
    pub fn address(&self, index_override: Option<u32>) -> crate::error::Result<SimulatorAddress> {
        SimulatorAddress::new(AddressLevel::Agent, index_override.unwrap_or(self.index), 0, 0)
    }
}

impl TransportConfig {
    pub fn connect_retry(&self) -> ConnectRetry {
        ConnectRetry {
            max_attempts: self.connect_attempts,
            delay: Duration::from_millis(self.connect_delay_ms),
            warn_after: self.connect_warn_after,
            attempt_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Keep-alive interval of worker runtimes (default: 5s)
    pub keep_alive_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SimulatorConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("coordinator.probe_interval_secs", 5)?
            .set_default("coordinator.probe_timeout_secs", 60)?
            .set_default("agent.index", 1)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (SIMULATOR__AGENT__INDEX, etc.)
        let builder = builder.add_source(
            Environment::with_prefix("SIMULATOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let coordinator = &self.coordinator;
        if coordinator.probe_interval_secs == 0 {
            errors.push("coordinator.probe_interval_secs must be positive".to_string());
        }
        if coordinator.probe_timeout_secs < coordinator.probe_interval_secs {
            errors.push(
                "coordinator.probe_timeout_secs must not be shorter than probe_interval_secs"
                    .to_string(),
            );
        }
        if coordinator.ping_timeout_ms == 0 {
            errors.push("coordinator.ping_timeout_ms must be positive".to_string());
        }
        if coordinator.keep_alive_interval_secs == 0 {
            errors.push("coordinator.keep_alive_interval_secs must be positive".to_string());
        }
        for (i, agent) in coordinator.agents.iter().enumerate() {
            if agent.public_address.trim().is_empty() {
                errors.push(format!("coordinator.agents[{i}].public_address is empty"));
            }
        }

        if self.agent.index == 0 {
            errors.push("agent.index must be at least 1".to_string());
        }
        if self.agent.check_interval_secs == 0 {
            errors.push("agent.check_interval_secs must be positive".to_string());
        }
        if self.agent.timeout_threshold_secs <= self.worker.keep_alive_interval_secs {
            errors.push(format!(
                "agent.timeout_threshold_secs ({}) must exceed worker.keep_alive_interval_secs ({})",
                self.agent.timeout_threshold_secs, self.worker.keep_alive_interval_secs
            ));
        }
        if self.worker.keep_alive_interval_secs == 0 {
            errors.push("worker.keep_alive_interval_secs must be positive".to_string());
        }

        if self.transport.connect_attempts == 0 {
            errors.push("transport.connect_attempts must be at least 1".to_string());
        }
        if self.transport.connect_timeout_ms == 0 || self.transport.handshake_timeout_ms == 0 {
            errors.push("transport connect and handshake timeouts must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
