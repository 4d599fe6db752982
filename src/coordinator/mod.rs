//! Coordinator
//!
//! Central control process of a run. Probes the agent fleet, starts
//! workers in member-then-client order, collects failure reports and tears
//! everything down at the end.

pub mod bootstrap;
#[allow(clippy::module_inception)]
pub mod coordinator;
pub mod deployment;
pub mod failure_collector;
pub mod startup;

pub use bootstrap::{bootstrap_connectivity, probe_agent, ConnectivityReport, ConnectivitySettings};
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use deployment::DeploymentPlan;
pub use failure_collector::FailureCollector;
pub use startup::{start_workers, StartFailure, StartupReport, StartupSettings};
