//! Test utilities for release-pipeline scenarios

use async_trait::async_trait;
use release_pipeline::backend::{
    BackendError, BuildExecutor, ExitStatus, InMemoryRegistry, StaticSource, UnitRegistry,
    Workspace,
};
use release_pipeline::core::config::PipelineConfig;
use release_pipeline::core::{ActionId, Artifact, Capability, Payload, Pipeline, StageState};
use release_pipeline::execution::{ExecutionEngine, ExecutionEvent, RunResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// One command the spy executor was asked to run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub action: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<String>,
}

/// Executor that records every invocation and answers from a script
///
/// Commands exit 0 unless an exit code was scripted for them. Every declared
/// output is produced with the payload set through `produce`, or the action
/// id when none was set, unless it was marked as withheld.
#[derive(Default)]
pub struct SpyExecutor {
    invocations: Mutex<Vec<Invocation>>,
    staged: Mutex<HashMap<Uuid, Vec<String>>>,
    exit_codes: HashMap<String, i32>,
    delays: HashMap<String, Duration>,
    payloads: HashMap<String, Payload>,
    withheld: Vec<String>,
    released: Mutex<usize>,
}

impl SpyExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `command` exit with `code`
    pub fn exit_code(mut self, command: &str, code: i32) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    /// Make `command` take `delay` before it exits
    pub fn delay(mut self, command: &str, delay: Duration) -> Self {
        self.delays.insert(command.to_string(), delay);
        self
    }

    /// Produce `payload` whenever `output` is collected
    pub fn produce(mut self, output: &str, payload: Payload) -> Self {
        self.payloads.insert(output.to_string(), payload);
        self
    }

    /// Never produce `output`
    pub fn withhold(mut self, output: &str) -> Self {
        self.withheld.push(output.to_string());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .map(|i| format!("{}:{}", i.action, i.command))
            .collect()
    }

    pub fn ran_in_stage(&self, stage: &str) -> bool {
        let prefix = format!("{}/", stage);
        self.invocations()
            .iter()
            .any(|i| i.action.starts_with(&prefix))
    }

    pub fn released(&self) -> usize {
        *self.released.lock().unwrap()
    }
}

#[async_trait]
impl BuildExecutor for SpyExecutor {
    async fn prepare(
        &self,
        action: &ActionId,
        inputs: &[Arc<Artifact>],
        _capability: &Capability,
    ) -> Result<Workspace, BackendError> {
        let id = Uuid::new_v4();
        self.staged.lock().unwrap().insert(
            id,
            inputs.iter().map(|a| a.name().to_string()).collect(),
        );
        Ok(Workspace {
            id,
            action: action.clone(),
            root: std::env::temp_dir(),
        })
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ExitStatus, BackendError> {
        if let Some(delay) = self.delays.get(command) {
            tokio::time::sleep(*delay).await;
        }
        let inputs = self
            .staged
            .lock()
            .unwrap()
            .get(&workspace.id)
            .cloned()
            .unwrap_or_default();
        self.invocations.lock().unwrap().push(Invocation {
            action: workspace.action.to_string(),
            command: command.to_string(),
            env: env.clone(),
            inputs,
        });
        Ok(ExitStatus(self.exit_codes.get(command).copied().unwrap_or(0)))
    }

    async fn collect(
        &self,
        workspace: &Workspace,
        outputs: &[String],
    ) -> Result<HashMap<String, Payload>, BackendError> {
        Ok(outputs
            .iter()
            .filter(|o| !self.withheld.contains(*o))
            .map(|o| {
                let payload = self
                    .payloads
                    .get(o)
                    .cloned()
                    .unwrap_or_else(|| Payload::from(workspace.action.to_string().as_str()));
                (o.clone(), payload)
            })
            .collect())
    }

    async fn release(&self, _workspace: Workspace) -> Result<(), BackendError> {
        *self.released.lock().unwrap() += 1;
        Ok(())
    }
}

/// Engine wired to a fixed source revision, the spy and `registry`
pub fn engine(
    executor: Arc<SpyExecutor>,
    registry: Arc<dyn UnitRegistry>,
) -> ExecutionEngine {
    ExecutionEngine::new(
        Arc::new(StaticSource::new("c0ffee", b"source tree".to_vec())),
        executor,
        registry,
    )
}

/// Run `pipeline` and return the result with every event it emitted
pub async fn run_with_events(
    engine: ExecutionEngine,
    pipeline: &Pipeline,
) -> (RunResult, Vec<ExecutionEvent>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let result = engine
        .with_event_handler(move |e| sink.lock().unwrap().push(e))
        .execute(pipeline)
        .await;
    let events = events.lock().unwrap().clone();
    (result, events)
}

pub fn pipeline(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml)
        .expect("pipeline yaml parses")
        .to_pipeline()
        .expect("pipeline is valid")
}

pub fn registry() -> Arc<InMemoryRegistry> {
    Arc::new(InMemoryRegistry::new().with_settle_polls(1))
}

/// Fast gate settings for test pipelines
pub const FAST_GATE: &str = r#"
settings:
  deploy:
    poll_interval_ms: 5
    settle_timeout_secs: 5
"#;

/// The reference release: source, unit tests, build, staging, integ tests, prod
pub fn release_yaml() -> String {
    format!(
        r#"
name: "Release"
variables:
  region: "us-east-1"
{}
stages:
  - name: Source
    actions:
      - name: checkout
        source: {{}}
        outputs: [src]
  - name: Unittest
    actions:
      - name: unit
        inputs: [src]
        commands: ["run_tests"]
  - name: Build
    actions:
      - name: package
        inputs: [src]
        outputs: [bin, template]
        env:
          COMMIT_ID: "${{commitId}}"
        commands: ["compile", "render_template"]
  - name: DeployStaging
    actions:
      - name: staging
        inputs: [template]
        deploy:
          target: "service-staging"
  - name: IntegTest
    actions:
      - name: integ
        inputs: [bin]
        env:
          TARGET: "service-staging.${{region}}"
        commands: ["run_integ_tests"]
  - name: DeployProd
    actions:
      - name: prod
        inputs: [template]
        deploy:
          target: "service-prod"
"#,
        FAST_GATE
    )
}

/// Template payload for the `template` artifact
pub fn template_payload() -> Payload {
    Payload::Bytes(b"image: service\nreplicas: 2\n".to_vec())
}

pub fn stage_names(result: &RunResult) -> Vec<(String, &'static str)> {
    result
        .state()
        .stage_names
        .iter()
        .zip(&result.state().stages)
        .map(|(name, state)| {
            let label = match state {
                StageState::Pending => "pending",
                StageState::Running { .. } => "running",
                StageState::Succeeded { .. } => "succeeded",
                StageState::Failed { .. } => "failed",
                StageState::Skipped { .. } => "skipped",
            };
            (name.clone(), label)
        })
        .collect()
}

pub fn assert_stage_states(result: &RunResult, expected: &[(&str, &str)]) {
    let actual = stage_names(result);
    let actual: Vec<(&str, &str)> = actual.iter().map(|(n, s)| (n.as_str(), *s)).collect();
    assert_eq!(actual, expected, "stage states");
}
