//! Worker side of the control plane

pub mod runtime;

pub use runtime::{WorkerRuntime, WorkerSettings};
