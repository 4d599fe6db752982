//! Worker launch parameters
//!
//! String properties (from the command line or a properties file) are bound
//! onto [`WorkerParameters`] through a fixed key table. Unknown keys are
//! rejected when the parameters are built, not when the worker starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SimulatorError};

/// Role a worker plays in the system under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerType {
    Member,
    LiteMember,
    Client,
}

impl WorkerType {
    /// Members and lite members form the cluster and must start before clients
    pub fn is_member(self) -> bool {
        matches!(self, WorkerType::Member | WorkerType::LiteMember)
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerType::Member => write!(f, "member"),
            WorkerType::LiteMember => write!(f, "lite-member"),
            WorkerType::Client => write!(f, "client"),
        }
    }
}

impl FromStr for WorkerType {
    type Err = SimulatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "member" => Ok(WorkerType::Member),
            "lite-member" | "litemember" => Ok(WorkerType::LiteMember),
            "client" | "javaclient" => Ok(WorkerType::Client),
            other => Err(SimulatorError::InvalidParameter(format!(
                "unknown worker type '{other}'"
            ))),
        }
    }
}

/// Everything an agent needs to start one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerParameters {
    pub worker_type: WorkerType,
    /// Version of the system under test, used by worker queries
    #[serde(default)]
    pub version: String,
    /// Driver the worker runs (member driver, client driver, ...)
    #[serde(default)]
    pub driver: String,
    /// Program to execute; empty means the simulator binary itself (`worker` subcommand)
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Options for the worker runtime, exported as `SIMULATOR_WORKER_OPTS`
    #[serde(default)]
    pub jvm_options: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Generated configuration content written next to the worker
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout_secs() -> u64 {
    60
}

type Setter = fn(&mut WorkerParameters, &str) -> Result<()>;

/// Key table for string property binding
const SETTERS: &[(&str, Setter)] = &[
    ("version", set_version),
    ("driver", set_driver),
    ("command", set_command),
    ("args", set_args),
    ("jvm_options", set_jvm_options),
    ("config", set_config),
    ("startup_timeout_secs", set_startup_timeout),
];

const ENV_PREFIX: &str = "env.";

fn set_version(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.version = v.to_string();
    Ok(())
}

fn set_driver(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.driver = v.to_string();
    Ok(())
}

fn set_command(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.command = v.to_string();
    Ok(())
}

fn set_args(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.args = v.split_whitespace().map(String::from).collect();
    Ok(())
}

fn set_jvm_options(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.jvm_options = v.split_whitespace().map(String::from).collect();
    Ok(())
}

fn set_config(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.config = Some(v.to_string());
    Ok(())
}

fn set_startup_timeout(p: &mut WorkerParameters, v: &str) -> Result<()> {
    p.startup_timeout_secs = v.trim().parse().map_err(|_| {
        SimulatorError::InvalidParameter(format!("startup_timeout_secs: '{v}' is not a number"))
    })?;
    Ok(())
}

impl WorkerParameters {
    pub fn new(worker_type: WorkerType) -> Self {
        Self {
            worker_type,
            version: String::new(),
            driver: String::new(),
            command: String::new(),
            args: Vec::new(),
            jvm_options: Vec::new(),
            env: BTreeMap::new(),
            config: None,
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }

    /// Bind string properties onto typed fields; unknown keys are an error
    pub fn from_properties(
        worker_type: WorkerType,
        properties: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut params = Self::new(worker_type);
        for (key, value) in properties {
            params.set(key, value)?;
        }
        Ok(params)
    }

    /// Set one property by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(name) = key.strip_prefix(ENV_PREFIX) {
            if name.is_empty() {
                return Err(SimulatorError::InvalidParameter(
                    "empty environment variable name".into(),
                ));
            }
            self.env.insert(name.to_string(), value.to_string());
            return Ok(());
        }

        match SETTERS.iter().find(|(name, _)| *name == key) {
            Some((_, setter)) => setter(self, value),
            None => Err(SimulatorError::InvalidParameter(format!(
                "unknown worker parameter '{key}'"
            ))),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, args: &[&str]) -> Self {
        self.command = command.into();
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }
}
