//! Test: End to End - a release through real shell processes and a file registry

#![cfg(unix)]

use release_pipeline::backend::{FileRegistry, ShellExecutor, StaticSource, UnitRegistry};
use release_pipeline::core::config::PipelineConfig;
use release_pipeline::core::{Payload, RunError};
use release_pipeline::execution::ExecutionEngine;
use release_pipeline::persistence::{
    create_summary, InMemoryPersistence, PersistenceBackend, RunOutcome,
};
use std::path::Path;
use std::sync::Arc;

const RELEASE: &str = r#"
name: "Shell release"
variables:
  replicas: "2"
settings:
  deploy:
    poll_interval_ms: 5
    settle_timeout_secs: 5
stages:
  - name: Source
    actions:
      - name: checkout
        source: {}
        outputs: [src]
  - name: Unittest
    actions:
      - name: unit
        inputs: [src]
        commands:
          - grep -q "fn main" "$PIPELINE_INPUT_DIR/src"
  - name: Build
    actions:
      - name: package
        inputs: [src]
        outputs: [bin, template]
        env:
          COMMIT_ID: "${commitId}"
          REPLICAS: "${replicas}"
        commands:
          - cp "$PIPELINE_INPUT_DIR/src" "$PIPELINE_OUTPUT_DIR/bin"
          - printf '{"image":"service:%s","replicas":%s}' "$COMMIT_ID" "$REPLICAS" > "$PIPELINE_OUTPUT_DIR/template"
  - name: DeployStaging
    actions:
      - name: staging
        inputs: [template]
        deploy:
          target: "service-staging"
"#;

fn engine(workspaces: &Path, registry: Arc<FileRegistry>, source: &str) -> ExecutionEngine {
    ExecutionEngine::new(
        Arc::new(StaticSource::new("4f2a9c1", source.as_bytes().to_vec())),
        Arc::new(ShellExecutor::new(workspaces)),
        registry,
    )
}

#[tokio::test]
async fn test_shell_release_deploys_rendered_template() {
    let workspaces = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    let registry = Arc::new(FileRegistry::open(units.path()).await.unwrap());
    let pipeline = PipelineConfig::from_yaml(RELEASE).unwrap().to_pipeline().unwrap();

    let result = engine(workspaces.path(), registry.clone(), "fn main() {}\n")
        .execute(&pipeline)
        .await;

    assert!(result.is_success(), "run failed: {:?}", result.error());
    let bin = result.artifacts().get_by_name("bin").unwrap();
    assert_eq!(bin.payload, Payload::from("fn main() {}\n"));

    let unit = registry.get("service-staging").await.unwrap().unwrap();
    assert_eq!(unit.template["image"], "service:4f2a9c1");
    assert_eq!(unit.template["replicas"], 2);

    // Workspaces are cleaned up after every action
    assert_eq!(std::fs::read_dir(workspaces.path()).unwrap().count(), 0);

    let history = InMemoryPersistence::new();
    history.save_run(&create_summary(result.state())).await.unwrap();
    let runs = history.list_runs("Shell release").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunOutcome::Succeeded);
    assert_eq!(runs[0].variables.get("commitId").map(String::as_str), Some("4f2a9c1"));
}

#[tokio::test]
async fn test_shell_release_stops_on_failing_tests() {
    let workspaces = tempfile::tempdir().unwrap();
    let units = tempfile::tempdir().unwrap();
    let registry = Arc::new(FileRegistry::open(units.path()).await.unwrap());
    let pipeline = PipelineConfig::from_yaml(RELEASE).unwrap().to_pipeline().unwrap();

    let result = engine(workspaces.path(), registry.clone(), "no entry point\n")
        .execute(&pipeline)
        .await;

    match result.error() {
        Some(RunError::CommandFailed { at, code, .. }) => {
            assert_eq!(at.to_string(), "Unittest/unit");
            assert_eq!(*code, 1);
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
    assert!(registry.get("service-staging").await.unwrap().is_none());

    let summary = create_summary(result.state());
    assert_eq!(summary.status, RunOutcome::Failed);
    assert_eq!(summary.failed_stage.as_deref(), Some("Unittest"));
    assert_eq!(summary.failed_action.as_deref(), Some("unit"));
}
