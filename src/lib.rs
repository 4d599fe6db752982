pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod worker;

pub use agent::{Agent, AgentSettings, LaunchMode, WorkerProcessManager};
pub use config::SimulatorConfig;
pub use coordinator::{Coordinator, CoordinatorSettings, DeploymentPlan, StartupReport};
pub use error::{Result, SimulatorError};
pub use protocol::{
    Endpoint, FailureKind, FailureOperation, OperationProcessor, Promise, SimulatorAddress,
    SimulatorOperation, Target, WorkerParameters, WorkerType,
};
pub use registry::{ComponentRegistry, TargetType, WorkerQuery};
pub use transport::{MessageBus, TcpTransport, Transport};
pub use worker::WorkerRuntime;
