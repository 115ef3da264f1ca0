//! Persistence layer for run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{ArtifactRef, BindingOrigin, RunState, RunStatus};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Final (or last known) status of a recorded run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Pending => "Pending",
            RunOutcome::Running => "Running",
            RunOutcome::Succeeded => "Succeeded",
            RunOutcome::Failed => "Failed",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Pending" => RunOutcome::Pending,
            "Running" => RunOutcome::Running,
            "Succeeded" => RunOutcome::Succeeded,
            "Failed" => RunOutcome::Failed,
            other => bail!("unknown run status '{}'", other),
        })
    }
}

impl From<&RunStatus> for RunOutcome {
    fn from(status: &RunStatus) -> Self {
        match status {
            RunStatus::Pending => RunOutcome::Pending,
            RunStatus::Running { .. } => RunOutcome::Running,
            RunStatus::Succeeded => RunOutcome::Succeeded,
            RunStatus::Failed { .. } => RunOutcome::Failed,
        }
    }
}

/// Summary of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run ID
    pub run_id: Uuid,

    pub pipeline_name: String,

    pub status: RunOutcome,

    /// Stage that failed, if any
    pub failed_stage: Option<String>,

    /// Action that failed, if any
    pub failed_action: Option<String>,

    /// Error message of the first failure
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    pub completed_stages: usize,

    pub total_stages: usize,

    /// Artifacts published by the run
    pub artifacts: Vec<ArtifactRef>,

    /// Variables bound by stages (e.g. the source revision)
    pub variables: BTreeMap<String, String>,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save (or replace) a run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// List the runs of a pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs
            .values()
            .filter(|r| r.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Create a summary from the state of a run
pub fn create_summary(state: &RunState) -> RunSummary {
    let failed = state.failed_action();

    let variables = state
        .variables
        .values()
        .into_iter()
        .filter(|(name, _)| {
            matches!(
                state.variables.binding(name).map(|b| &b.origin),
                Some(BindingOrigin::Stage(_))
            )
        })
        .collect();

    RunSummary {
        run_id: state.run_id,
        pipeline_name: state.pipeline_name.clone(),
        status: RunOutcome::from(state.status()),
        failed_stage: failed.map(|a| a.stage.clone()),
        failed_action: failed.map(|a| a.action.clone()),
        error: state.error.as_ref().map(|e| e.to_string()),
        started_at: state.started_at.unwrap_or_else(Utc::now),
        finished_at: state.finished_at,
        progress: state.progress(),
        completed_stages: state.completed_stages(),
        total_stages: state.stages.len(),
        artifacts: state.artifacts.references().to_vec(),
        variables,
    }
}
