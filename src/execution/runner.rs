//! Stage runner - executes a single resolved action

use crate::backend::{BackendError, BuildExecutor, ExitStatus, SourceProvider, Workspace};
use crate::core::{
    Action, ActionId, ActionKind, Artifact, Capability, InputKind, Payload, RunError,
};
use crate::execution::gate::{DeployResult, DeploymentGate};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// An action with everything it needs bound at stage entry
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub id: ActionId,
    pub action: Action,
    /// Input artifacts, in the order the action declares them
    pub inputs: Vec<Arc<Artifact>>,
    /// Rendered environment
    pub env: BTreeMap<String, String>,
    pub capability: Capability,
    pub timeout: Duration,
}

impl ResolvedAction {
    fn input(&self, name: &str) -> Option<&Arc<Artifact>> {
        self.inputs.iter().find(|a| a.name() == name)
    }
}

/// What a successful action hands back to the engine
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    /// Declared outputs, in declared order
    pub artifacts: Vec<(String, Payload)>,
    /// Variables to bind once the stage succeeds
    pub variables: Vec<(String, String)>,
    /// Exit status of the last command
    pub status: Option<ExitStatus>,
    pub deployment: Option<DeployResult>,
}

/// Runs actions against the collaborators
#[derive(Clone)]
pub struct StageRunner {
    source: Arc<dyn SourceProvider>,
    executor: Arc<dyn BuildExecutor>,
    gate: DeploymentGate,
}

impl StageRunner {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        executor: Arc<dyn BuildExecutor>,
        gate: DeploymentGate,
    ) -> Self {
        Self {
            source,
            executor,
            gate,
        }
    }

    /// Run one action
    ///
    /// Outputs are returned only when the action succeeded as a whole.
    pub async fn run(&self, resolved: &ResolvedAction) -> Result<ActionOutput, RunError> {
        info!("Running action {} ({})", resolved.id, resolved.action.kind.label());

        for name in &resolved.action.inputs {
            if resolved.input(name).is_none() {
                return Err(RunError::MissingInput {
                    at: resolved.id.clone(),
                    kind: InputKind::Artifact,
                    name: name.clone(),
                });
            }
        }

        let result = match &resolved.action.kind {
            ActionKind::Commands(commands) => self.run_commands(resolved, commands).await,
            ActionKind::Source { revision_variable } => {
                bounded(resolved, self.run_source(resolved, revision_variable)).await
            }
            ActionKind::Deploy { target } => {
                bounded(resolved, self.run_deploy(resolved, target)).await
            }
        };

        match &result {
            Ok(_) => info!("Action {} succeeded", resolved.id),
            Err(e) => error!("Action {} failed: {}", resolved.id, e),
        }
        result
    }

    async fn run_commands(
        &self,
        resolved: &ResolvedAction,
        commands: &[String],
    ) -> Result<ActionOutput, RunError> {
        let workspace = self
            .executor
            .prepare(&resolved.id, &resolved.inputs, &resolved.capability)
            .await
            .map_err(|e| backend(&resolved.id, e))?;

        let result = bounded(resolved, self.execute_in(&workspace, resolved, commands)).await;

        // the workspace goes away whatever happened inside it
        if let Err(e) = self.executor.release(workspace).await {
            warn!("Failed to release workspace for {}: {}", resolved.id, e);
        }
        result
    }

    async fn execute_in(
        &self,
        workspace: &Workspace,
        resolved: &ResolvedAction,
        commands: &[String],
    ) -> Result<ActionOutput, RunError> {
        let mut last = ExitStatus::SUCCESS;
        for (index, command) in commands.iter().enumerate() {
            debug!("{} command #{}: {}", resolved.id, index, command);
            last = self
                .executor
                .execute(workspace, command, &resolved.env)
                .await
                .map_err(|e| backend(&resolved.id, e))?;

            if !last.success() {
                return Err(RunError::CommandFailed {
                    at: resolved.id.clone(),
                    index,
                    command: command.clone(),
                    code: last.code(),
                });
            }
        }

        let mut collected = self
            .executor
            .collect(workspace, &resolved.action.outputs)
            .await
            .map_err(|e| backend(&resolved.id, e))?;

        let mut artifacts = Vec::with_capacity(resolved.action.outputs.len());
        for name in &resolved.action.outputs {
            let payload = collected.remove(name).ok_or_else(|| RunError::OutputMissing {
                at: resolved.id.clone(),
                name: name.clone(),
            })?;
            artifacts.push((name.clone(), payload));
        }

        Ok(ActionOutput {
            artifacts,
            status: Some(last),
            ..ActionOutput::default()
        })
    }

    async fn run_source(
        &self,
        resolved: &ResolvedAction,
        revision_variable: &str,
    ) -> Result<ActionOutput, RunError> {
        let snapshot = self
            .source
            .fetch(&resolved.capability)
            .await
            .map_err(|e| backend(&resolved.id, e))?;

        info!("Fetched revision {} for {}", snapshot.revision, resolved.id);

        let artifacts = resolved
            .action
            .outputs
            .iter()
            .map(|name| (name.clone(), Payload::Bytes(snapshot.content.clone())))
            .collect();

        Ok(ActionOutput {
            artifacts,
            variables: vec![(revision_variable.to_string(), snapshot.revision)],
            ..ActionOutput::default()
        })
    }

    async fn run_deploy(
        &self,
        resolved: &ResolvedAction,
        target: &str,
    ) -> Result<ActionOutput, RunError> {
        let template = resolved
            .action
            .inputs
            .first()
            .and_then(|name| resolved.input(name))
            .ok_or_else(|| RunError::MissingInput {
                at: resolved.id.clone(),
                kind: InputKind::Artifact,
                name: resolved.action.inputs.first().cloned().unwrap_or_default(),
            })?;

        let deployment = self
            .gate
            .deploy(&resolved.id, template, target, &resolved.capability)
            .await?;

        Ok(ActionOutput {
            deployment: Some(deployment),
            ..ActionOutput::default()
        })
    }
}

/// Bound `work` by the action's timeout
async fn bounded<F>(resolved: &ResolvedAction, work: F) -> Result<ActionOutput, RunError>
where
    F: Future<Output = Result<ActionOutput, RunError>>,
{
    match timeout(resolved.timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            error!("Timeout for {} after {:?}", resolved.id, resolved.timeout);
            Err(RunError::TimedOut {
                at: resolved.id.clone(),
                secs: resolved.timeout.as_secs(),
            })
        }
    }
}

fn backend(at: &ActionId, e: BackendError) -> RunError {
    RunError::Backend {
        at: at.clone(),
        message: e.to_string(),
    }
}
