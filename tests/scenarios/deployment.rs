//! Test: Deployment - units go through the gate and converge idempotently

use crate::helpers::*;
use release_pipeline::backend::{
    FileRegistry, InMemoryRegistry, UnitRegistry, UnitStatus, UpsertOutcome,
};
use release_pipeline::core::{Payload, RunError};
use release_pipeline::execution::ExecutionEvent;
use serde_json::json;
use std::sync::Arc;

fn outcomes(events: &[ExecutionEvent]) -> Vec<UpsertOutcome> {
    events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::UnitDeployed { result, .. } => Some(result.outcome),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_redeploying_same_template_is_unchanged() {
    let registry = registry();
    let pipeline = pipeline(&release_yaml());

    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let (first, events) = run_with_events(engine(executor, registry.clone()), &pipeline).await;
    assert!(first.is_success());
    assert_eq!(outcomes(&events), vec![UpsertOutcome::Created, UpsertOutcome::Created]);
    let generation = registry.get("service-prod").await.unwrap().unwrap().generation;

    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let (second, events) = run_with_events(engine(executor, registry.clone()), &pipeline).await;
    assert!(second.is_success());
    assert_eq!(
        outcomes(&events),
        vec![UpsertOutcome::Unchanged, UpsertOutcome::Unchanged]
    );
    assert_eq!(
        registry.get("service-prod").await.unwrap().unwrap().generation,
        generation
    );
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn test_changed_template_updates_unit() {
    let registry = registry();
    let pipeline = pipeline(&release_yaml());

    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    engine(executor, registry.clone()).execute(&pipeline).await;

    let executor = Arc::new(SpyExecutor::new().produce(
        "template",
        Payload::from(json!({ "image": "service", "replicas": 3 })),
    ));
    let (result, events) = run_with_events(engine(executor, registry.clone()), &pipeline).await;

    assert!(result.is_success());
    assert_eq!(outcomes(&events), vec![UpsertOutcome::Updated, UpsertOutcome::Updated]);
    let unit = registry.get("service-staging").await.unwrap().unwrap();
    assert_eq!(unit.generation, 2);
    assert_eq!(unit.template["replicas"], 3);
}

#[tokio::test]
async fn test_template_that_is_not_a_mapping_fails_deploy() {
    let list = Payload::from("- just\n- a list\n");
    let executor = Arc::new(SpyExecutor::new().produce("template", list));
    let registry = registry();
    let pipeline = pipeline(&release_yaml());

    let result = engine(executor.clone(), registry.clone()).execute(&pipeline).await;

    match result.error() {
        Some(RunError::UpsertFailed { at, target, .. }) => {
            assert_eq!(at.to_string(), "DeployStaging/staging");
            assert_eq!(target, "service-staging");
        }
        other => panic!("expected UpsertFailed, got {:?}", other),
    }
    assert!(registry.is_empty().await);
    assert!(!executor.ran_in_stage("IntegTest"));
}

#[tokio::test]
async fn test_denied_deploy_fails_without_touching_unit() {
    let yaml = format!(
        r#"
name: "Scoped"
{}
stages:
  - name: Build
    actions:
      - name: render
        outputs: [template]
        commands: ["render"]
  - name: DeployStaging
    actions:
      - name: staging
        inputs: [template]
        permissions: ["deploy:service-staging"]
        deploy:
          target: "service-staging"
  - name: DeployProd
    actions:
      - name: prod
        inputs: [template]
        permissions: ["deploy:service-staging"]
        deploy:
          target: "service-prod"
"#,
        FAST_GATE
    );
    let registry = Arc::new(InMemoryRegistry::new().enforce_scopes());
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));

    let result = engine(executor, registry.clone()).execute(&pipeline(&yaml)).await;

    assert_eq!(result.failed_action().unwrap().to_string(), "DeployProd/prod");
    assert!(matches!(result.error(), Some(RunError::UpsertFailed { .. })));
    assert_eq!(
        registry.status("service-staging").await.unwrap(),
        UnitStatus::Stable
    );
    assert_eq!(
        registry.status("service-prod").await.unwrap(),
        UnitStatus::Missing
    );
}

#[tokio::test]
async fn test_units_survive_in_file_registry() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&release_yaml());

    {
        let registry = Arc::new(FileRegistry::open(dir.path()).await.unwrap());
        let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
        let result = engine(executor, registry).execute(&pipeline).await;
        assert!(result.is_success(), "run failed: {:?}", result.error());
    }

    let registry = Arc::new(FileRegistry::open(dir.path()).await.unwrap());
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let (result, events) = run_with_events(engine(executor, registry.clone()), &pipeline).await;

    assert!(result.is_success());
    assert_eq!(
        outcomes(&events),
        vec![UpsertOutcome::Unchanged, UpsertOutcome::Unchanged]
    );
    assert_eq!(registry.get("service-prod").await.unwrap().unwrap().generation, 1);
}
