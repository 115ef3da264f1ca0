//! Main execution engine - drives a pipeline run stage by stage

use crate::{
    backend::{BuildExecutor, SourceProvider, UnitRegistry},
    core::{
        ActionId, ArtifactRef, ArtifactStore, BindingOrigin, InputKind, Pipeline, RunError,
        RunState, RunStatus, Stage, StageState, VariableScope,
    },
    execution::{
        gate::{DeployResult, DeploymentGate},
        runner::{ActionOutput, ResolvedAction, StageRunner},
        SchedulingStrategy,
    },
};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline_name: String,
        stages: usize,
    },
    StageStarted {
        index: usize,
        stage: String,
        actions: usize,
    },
    ActionStarted {
        action: ActionId,
    },
    ActionSucceeded {
        action: ActionId,
    },
    ActionFailed {
        action: ActionId,
        error: RunError,
    },
    /// Not started because a sibling had already failed
    ActionSkipped {
        action: ActionId,
    },
    ArtifactPublished {
        stage: String,
        reference: ArtifactRef,
    },
    VariableBound {
        stage: String,
        name: String,
        value: String,
    },
    UnitDeployed {
        action: ActionId,
        result: DeployResult,
    },
    StageSucceeded {
        index: usize,
        stage: String,
    },
    StageFailed {
        index: usize,
        stage: String,
        error: RunError,
    },
    StageSkipped {
        index: usize,
        stage: String,
    },
    PipelineFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunResult {
    state: RunState,
}

impl RunResult {
    pub fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    pub fn status(&self) -> &RunStatus {
        self.state.status()
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    /// First failure of the run
    pub fn error(&self) -> Option<&RunError> {
        self.state.error.as_ref()
    }

    /// The failing stage and action
    pub fn failed_action(&self) -> Option<&ActionId> {
        self.state.failed_action()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.state.artifacts
    }

    pub fn variables(&self) -> &VariableScope {
        &self.state.variables
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Release the run's artifacts
    pub fn discard_artifacts(&mut self) {
        self.state.artifacts.discard();
    }

    pub fn into_state(self) -> RunState {
        self.state
    }
}

/// Result of dispatching one action
enum Dispatched {
    Finished(Result<ActionOutput, RunError>),
    Skipped,
}

/// Main pipeline execution engine
///
/// The engine is the only component that advances a run. Stages run strictly
/// in order; the actions of a stage are dispatched per the scheduling
/// strategy and joined before anything they produced becomes visible.
pub struct ExecutionEngine {
    source: Arc<dyn SourceProvider>,
    executor: Arc<dyn BuildExecutor>,
    registry: Arc<dyn UnitRegistry>,
    strategy: Option<SchedulingStrategy>,
    event_handlers: Vec<EventHandler>,
}

impl ExecutionEngine {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        executor: Arc<dyn BuildExecutor>,
        registry: Arc<dyn UnitRegistry>,
    ) -> Self {
        Self {
            source,
            executor,
            registry,
            strategy: None,
            event_handlers: Vec::new(),
        }
    }

    /// Override the strategy the pipeline settings ask for
    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Add an event handler
    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
        self
    }

    fn emit(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    /// Execute the whole pipeline
    pub async fn execute(&self, pipeline: &Pipeline) -> RunResult {
        let mut state = RunState::new(pipeline);
        let strategy = self
            .strategy
            .unwrap_or_else(|| SchedulingStrategy::from(pipeline.settings()));
        let runner = StageRunner::new(
            self.source.clone(),
            self.executor.clone(),
            DeploymentGate::new(self.registry.clone(), &pipeline.settings().deploy),
        );

        info!(
            "Starting pipeline execution: {} ({}, {:?})",
            pipeline.name(),
            state.run_id,
            strategy
        );
        self.emit(ExecutionEvent::PipelineStarted {
            run_id: state.run_id,
            pipeline_name: pipeline.name().to_string(),
            stages: pipeline.stages().len(),
        });

        for (index, stage) in pipeline.stages().iter().enumerate() {
            advance(&mut state, RunStatus::Running { stage: index });

            let started_at = Utc::now();
            state.stages[index] = StageState::Running { started_at };
            info!("Entering stage {} ({}/{})", stage.name, index + 1, state.stages.len());
            self.emit(ExecutionEvent::StageStarted {
                index,
                stage: stage.name.clone(),
                actions: stage.actions.len(),
            });

            match self.run_stage(pipeline, stage, &mut state, &runner, strategy).await {
                Ok(()) => {
                    state.stages[index] = StageState::Succeeded {
                        started_at,
                        finished_at: Utc::now(),
                    };
                    info!("Stage {} succeeded", stage.name);
                    self.emit(ExecutionEvent::StageSucceeded {
                        index,
                        stage: stage.name.clone(),
                    });
                }
                Err(error) => {
                    error!("Stage {} failed: {}", stage.name, error);
                    state.stages[index] = StageState::Failed {
                        action: error.action().action.clone(),
                        error: error.to_string(),
                        started_at,
                        failed_at: Utc::now(),
                    };
                    self.emit(ExecutionEvent::StageFailed {
                        index,
                        stage: stage.name.clone(),
                        error: error.clone(),
                    });
                    state.error = Some(error);
                    advance(&mut state, RunStatus::Failed { stage: index });
                    self.skip_remaining(pipeline, &mut state, index);
                    return self.finish(state);
                }
            }
        }

        advance(&mut state, RunStatus::Succeeded);
        self.finish(state)
    }

    fn finish(&self, state: RunState) -> RunResult {
        info!(
            "Pipeline {} finished: {:?} ({} artifacts)",
            state.pipeline_name,
            state.status(),
            state.artifacts.len()
        );
        self.emit(ExecutionEvent::PipelineFinished {
            run_id: state.run_id,
            status: state.status().clone(),
        });
        RunResult { state }
    }

    fn skip_remaining(&self, pipeline: &Pipeline, state: &mut RunState, failed: usize) {
        let reason = format!("stage '{}' failed", pipeline.stages()[failed].name);
        for (index, stage) in pipeline.stages().iter().enumerate().skip(failed + 1) {
            state.stages[index] = StageState::Skipped {
                reason: reason.clone(),
            };
            self.emit(ExecutionEvent::StageSkipped {
                index,
                stage: stage.name.clone(),
            });
        }
    }

    /// Run every action of `stage`, then publish what they produced
    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
        state: &mut RunState,
        runner: &StageRunner,
        strategy: SchedulingStrategy,
    ) -> Result<(), RunError> {
        let resolved = self.resolve(pipeline, stage, state)?;
        let ids: Vec<ActionId> = resolved.iter().map(|r| r.id.clone()).collect();
        let results = self.dispatch(resolved, runner, strategy).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (id, dispatched) in ids.iter().zip(results) {
            match dispatched {
                Some(Dispatched::Finished(Ok(output))) => {
                    self.emit(ExecutionEvent::ActionSucceeded { action: id.clone() });
                    outputs.push((id, output));
                }
                Some(Dispatched::Finished(Err(error))) => {
                    self.emit(ExecutionEvent::ActionFailed {
                        action: id.clone(),
                        error: error.clone(),
                    });
                    first_error.get_or_insert(error);
                }
                Some(Dispatched::Skipped) => {
                    self.emit(ExecutionEvent::ActionSkipped { action: id.clone() });
                }
                None => {
                    let error = RunError::Backend {
                        at: id.clone(),
                        message: "action task aborted".to_string(),
                    };
                    self.emit(ExecutionEvent::ActionFailed {
                        action: id.clone(),
                        error: error.clone(),
                    });
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            if !outputs.is_empty() {
                debug!(
                    "Discarding outputs of {} completed actions in {}",
                    outputs.len(),
                    stage.name
                );
            }
            return Err(error);
        }

        self.publish(stage, state, outputs)
    }

    /// Bind inputs and environment for every action of the stage
    ///
    /// Fails on the first action (in declared order) with an unresolvable
    /// input, before any action of the stage starts.
    fn resolve(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
        state: &RunState,
    ) -> Result<Vec<ResolvedAction>, RunError> {
        stage
            .actions
            .iter()
            .map(|action| {
                let id = ActionId::new(&stage.name, &action.name);

                let inputs = action
                    .inputs
                    .iter()
                    .map(|name| {
                        state
                            .artifacts
                            .get_by_name(name)
                            .map_err(|_| RunError::MissingInput {
                                at: id.clone(),
                                kind: InputKind::Artifact,
                                name: name.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let env: BTreeMap<String, String> = action
                    .env
                    .iter()
                    .map(|(key, template)| {
                        template
                            .render(&state.variables)
                            .map(|value| (key.clone(), value))
                            .map_err(|name| RunError::MissingInput {
                                at: id.clone(),
                                kind: InputKind::Variable,
                                name,
                            })
                    })
                    .collect::<Result<_, _>>()?;

                Ok(ResolvedAction {
                    capability: pipeline.capability_for(action),
                    timeout: action
                        .timeout
                        .unwrap_or_else(|| pipeline.settings().default_timeout()),
                    id,
                    action: action.clone(),
                    inputs,
                    env,
                })
            })
            .collect()
    }

    /// Run the resolved actions and join them
    ///
    /// Results come back in declared order. Once an action failed, actions
    /// that have not been dispatched yet are skipped; those already running
    /// are allowed to finish.
    async fn dispatch(
        &self,
        resolved: Vec<ResolvedAction>,
        runner: &StageRunner,
        strategy: SchedulingStrategy,
    ) -> Vec<Option<Dispatched>> {
        let count = resolved.len();
        let semaphore = strategy.semaphore(count);
        let failed = Arc::new(AtomicBool::new(false));
        let mut results: Vec<Option<Dispatched>> = (0..count).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (position, action) in resolved.into_iter().enumerate() {
            // waits for a running sibling when the strategy caps concurrency
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if failed.load(Ordering::SeqCst) {
                debug!("Skipping {}: a sibling failed", action.id);
                results[position] = Some(Dispatched::Skipped);
                continue;
            }

            self.emit(ExecutionEvent::ActionStarted {
                action: action.id.clone(),
            });

            let runner = runner.clone();
            let failed = failed.clone();
            tasks.spawn(async move {
                let result = runner.run(&action).await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                drop(permit);
                (position, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(Dispatched::Finished(result)),
                Err(e) => warn!("Action task did not complete: {}", e),
            }
        }

        results
    }

    /// Make the stage's outputs visible to later stages
    ///
    /// Every name is checked before anything is written, so a conflict
    /// publishes nothing.
    fn publish(
        &self,
        stage: &Stage,
        state: &mut RunState,
        outputs: Vec<(&ActionId, ActionOutput)>,
    ) -> Result<(), RunError> {
        let mut pending = HashSet::new();
        for (id, output) in &outputs {
            for (name, _) in &output.artifacts {
                if state.artifacts.contains(name) || !pending.insert(name.as_str()) {
                    return Err(RunError::ArtifactConflict {
                        at: (*id).clone(),
                        name: name.clone(),
                    });
                }
            }
        }

        for (id, output) in outputs {
            for (name, payload) in output.artifacts {
                let reference = state.artifacts.put(&name, payload).map_err(|_| {
                    RunError::ArtifactConflict {
                        at: id.clone(),
                        name: name.clone(),
                    }
                })?;
                debug!("Published {} ({} bytes)", reference.name, reference.size);
                self.emit(ExecutionEvent::ArtifactPublished {
                    stage: stage.name.clone(),
                    reference,
                });
            }

            for (name, value) in output.variables {
                info!("Bound {} = {} from stage {}", name, value, stage.name);
                state
                    .variables
                    .bind(&name, &value, BindingOrigin::Stage(stage.name.clone()));
                self.emit(ExecutionEvent::VariableBound {
                    stage: stage.name.clone(),
                    name,
                    value,
                });
            }

            if let Some(result) = output.deployment {
                self.emit(ExecutionEvent::UnitDeployed {
                    action: id.clone(),
                    result,
                });
            }
        }

        Ok(())
    }
}

/// Apply a state transition the engine's own loop guarantees to be valid
fn advance(state: &mut RunState, next: RunStatus) {
    if let Err(e) = state.transition(next) {
        error!("{}", e);
    }
}
