//! Collaborators the engine delegates real work to
//!
//! The engine only talks to these traits: a source provider for the initial
//! snapshot, a build executor for commands, and a unit registry for
//! deployments. Concrete implementations live in the submodules.

pub mod registry;
pub mod retry;
pub mod shell;
pub mod source;

use crate::core::{ActionId, Artifact, Capability, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use registry::{FileRegistry, InMemoryRegistry};
pub use retry::{RetryPolicy, RetryingRegistry};
pub use shell::ShellExecutor;
pub use source::{GitSource, StaticSource};

/// Error types for collaborator operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("permission denied: {0}")]
    Denied(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Io(_) | BackendError::Internal(_))
    }
}

/// Exit status of a single command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn success(&self) -> bool {
        self.0 == 0
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        // killed by a signal
        ExitStatus(status.code().unwrap_or(-1))
    }
}

/// Isolated working area prepared for one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: Uuid,
    pub action: ActionId,
    pub root: PathBuf,
}

/// Snapshot handed out by a source provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// Revision identifier (e.g. a commit id)
    pub revision: String,
    /// Snapshot content
    pub content: Vec<u8>,
}

/// Supplies the source snapshot a run starts from
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, capability: &Capability) -> Result<SourceSnapshot, BackendError>;
}

/// Command-execution sandbox
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Create a workspace holding the action's resolved inputs
    async fn prepare(
        &self,
        action: &ActionId,
        inputs: &[Arc<Artifact>],
        capability: &Capability,
    ) -> Result<Workspace, BackendError>;

    /// Run one command in the workspace with the given environment
    async fn execute(
        &self,
        workspace: &Workspace,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ExitStatus, BackendError>;

    /// Read back the declared outputs the commands produced
    ///
    /// Outputs that were not produced are simply absent from the map.
    async fn collect(
        &self,
        workspace: &Workspace,
        outputs: &[String],
    ) -> Result<HashMap<String, Payload>, BackendError>;

    /// Dispose of the workspace
    async fn release(&self, _workspace: Workspace) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// The unit already ran this exact template
    Unchanged,
}

/// Convergence state of a deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Stable,
    Settling,
    Failed(String),
    Missing,
}

/// A deployable unit as recorded by a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedUnit {
    pub name: String,
    pub template: serde_json::Value,
    /// Digest of the template, as computed for artifacts
    pub digest: String,
    /// Bumped on every change
    pub generation: u64,
    pub deployed_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Infrastructure-state store holding deployable units
#[async_trait]
pub trait UnitRegistry: Send + Sync {
    /// Create `name` from `template`, or update it in place
    async fn upsert(
        &self,
        name: &str,
        template: &serde_json::Value,
        capability: &Capability,
    ) -> Result<UpsertOutcome, BackendError>;

    async fn status(&self, name: &str) -> Result<UnitStatus, BackendError>;

    async fn get(&self, name: &str) -> Result<Option<DeployedUnit>, BackendError>;
}
