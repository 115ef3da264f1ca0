//! Pipeline execution engine

pub mod engine;
pub mod gate;
pub mod runner;
pub mod scheduler;

pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent, RunResult};
pub use gate::{DeployResult, DeploymentGate};
pub use runner::{ActionOutput, ResolvedAction, StageRunner};
pub use scheduler::SchedulingStrategy;
