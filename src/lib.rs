//! release-pipeline - A sequential release-pipeline executor
//!
//! A pipeline is an ordered list of stages. Each stage runs its actions,
//! publishes their artifacts and variables once all of them succeeded, and
//! only then lets the next stage start. Deployments go through a gate that
//! waits for the deployed unit to become stable.

pub mod backend;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use backend::{BuildExecutor, SourceProvider, UnitRegistry};
pub use core::{Action, ArtifactStore, Pipeline, RunError, RunState, RunStatus, Stage};
pub use execution::{ExecutionEngine, ExecutionEvent, RunResult, SchedulingStrategy};
