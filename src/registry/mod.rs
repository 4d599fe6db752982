//! Coordinator-side registry of agents, workers and tests

pub mod components;
pub mod data;
pub mod layout;
pub mod query;

pub use components::ComponentRegistry;
pub use data::{AgentData, Tags, TestCase, TestData, TestStatus, TestSuite, WorkerData};
pub use layout::{print_layout, render_layout};
pub use query::{fair_sample, TargetType, WorkerQuery};
