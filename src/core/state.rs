//! Execution state models

use crate::core::{
    artifact::ArtifactStore,
    context::VariableScope,
    error::{ActionId, RunError},
    Pipeline,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Stage `stage` is executing
    Running { stage: usize },
    /// Every stage succeeded
    Succeeded,
    /// Stage `stage` failed; later stages never ran
    Failed { stage: usize },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed { .. })
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// State of a single stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageState {
    /// Stage has not been entered
    Pending,
    /// Stage is running
    Running { started_at: DateTime<Utc> },
    /// All actions succeeded and outputs were published
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// An action failed; the stage published nothing
    Failed {
        action: String,
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Never entered because an earlier stage failed
    Skipped { reason: String },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded { .. } | StageState::Failed { .. } | StageState::Skipped { .. }
        )
    }
}

/// Per-execution state
///
/// Only the engine mutates it, and only by advancing through the stages.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Unique execution ID
    pub run_id: Uuid,

    pub pipeline_name: String,

    /// Stage names, in order
    pub stage_names: Vec<String>,

    status: RunStatus,

    /// Index of the stage being (or last) executed
    pub current_stage: usize,

    /// Per-stage status, parallel to `stage_names`
    pub stages: Vec<StageState>,

    /// Artifacts published so far
    pub artifacts: ArtifactStore,

    /// Variables bound so far
    pub variables: VariableScope,

    /// First failure, if any
    pub error: Option<RunError>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Fresh state for a run of `pipeline`
    pub fn new(pipeline: &Pipeline) -> Self {
        let mut variables = VariableScope::from_pipeline(pipeline.variables());
        for (key, value) in pipeline.overrides() {
            variables.bind(key, value, crate::core::context::BindingOrigin::Override);
        }

        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: pipeline.name().to_string(),
            stage_names: pipeline.stages().iter().map(|s| s.name.clone()).collect(),
            status: RunStatus::Pending,
            current_stage: 0,
            stages: vec![StageState::Pending; pipeline.stages().len()],
            artifacts: ArtifactStore::new(),
            variables,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Move the run to `next`
    ///
    /// Allowed: `Pending -> Running(0)`, `Running(i) -> Running(i + 1)`,
    /// `Running(last) -> Succeeded`, `Running(i) -> Failed(i)`. Nothing
    /// leaves a terminal state.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        let last = self.stage_names.len().saturating_sub(1);
        let allowed = match (&self.status, &next) {
            (RunStatus::Pending, RunStatus::Running { stage: 0 }) => true,
            (RunStatus::Running { stage: i }, RunStatus::Running { stage: j }) => *j == i + 1,
            (RunStatus::Running { stage: i }, RunStatus::Succeeded) => *i == last,
            (RunStatus::Running { stage: i }, RunStatus::Failed { stage: j }) => i == j,
            _ => false,
        };

        if !allowed {
            return Err(TransitionError {
                from: self.status.clone(),
                to: next,
            });
        }

        match &next {
            RunStatus::Running { stage } => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.current_stage = *stage;
            }
            RunStatus::Succeeded | RunStatus::Failed { .. } => {
                self.finished_at = Some(Utc::now());
            }
            RunStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// The failing stage and action, once the run failed
    pub fn failed_action(&self) -> Option<&ActionId> {
        self.error.as_ref().map(RunError::action)
    }

    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, StageState::Succeeded { .. }))
            .count()
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        self.completed_stages() as f64 / self.stages.len() as f64
    }
}
