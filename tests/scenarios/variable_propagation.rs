//! Test: Variable Propagation - bindings flow forward through stages

use crate::helpers::*;
use release_pipeline::core::{BindingOrigin, InputKind, RunError};
use release_pipeline::execution::ExecutionEvent;
use std::sync::Arc;

#[tokio::test]
async fn test_revision_reaches_later_stages() {
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let pipeline = pipeline(&release_yaml());

    let (_, events) = run_with_events(engine(executor.clone(), registry()), &pipeline).await;

    let build = executor
        .invocations()
        .into_iter()
        .find(|i| i.action == "Build/package")
        .unwrap();
    assert_eq!(build.env["COMMIT_ID"], "c0ffee");
    assert_eq!(build.inputs, vec!["src".to_string()]);

    let integ = executor
        .invocations()
        .into_iter()
        .find(|i| i.action == "IntegTest/integ")
        .unwrap();
    assert_eq!(integ.env["TARGET"], "service-staging.us-east-1");
    assert_eq!(integ.inputs, vec!["bin".to_string()]);

    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::VariableBound { stage, name, value }
            if stage == "Source" && name == "commitId" && value == "c0ffee"
    )));
}

#[tokio::test]
async fn test_overrides_win_over_pipeline_variables() {
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let mut pipeline = pipeline(&release_yaml());
    pipeline.override_variable("region", "eu-west-1");

    let result = engine(executor.clone(), registry()).execute(&pipeline).await;

    assert!(result.is_success());
    let integ = executor
        .invocations()
        .into_iter()
        .find(|i| i.action == "IntegTest/integ")
        .unwrap();
    assert_eq!(integ.env["TARGET"], "service-staging.eu-west-1");
    assert_eq!(
        result.variables().binding("region").unwrap().origin,
        BindingOrigin::Override
    );
}

#[tokio::test]
async fn test_unbound_variable_fails_the_binding_stage() {
    let yaml = r#"
name: "Unbound"
stages:
  - name: Source
    actions:
      - name: checkout
        source:
          revision_variable: revision
        outputs: [src]
  - name: Build
    actions:
      - name: package
        inputs: [src]
        env:
          COMMIT_ID: "${commitId}"
        commands: ["compile"]
"#;
    let executor = Arc::new(SpyExecutor::new());
    let pipeline = pipeline(yaml);

    let result = engine(executor.clone(), registry()).execute(&pipeline).await;

    match result.error() {
        Some(RunError::MissingInput { at, kind, name }) => {
            assert_eq!(at.to_string(), "Build/package");
            assert_eq!(*kind, InputKind::Variable);
            assert_eq!(name, "commitId");
        }
        other => panic!("expected MissingInput, got {:?}", other),
    }
    // Resolution happens before dispatch, so nothing ran
    assert!(executor.invocations().is_empty());
    assert_eq!(result.variables().get("revision"), Some("c0ffee"));
}

#[tokio::test]
async fn test_failed_stage_binds_nothing() {
    let yaml = r#"
name: "Half bound"
settings:
  strategy: parallel
stages:
  - name: Source
    actions:
      - name: checkout
        source: {}
        outputs: [src]
      - name: verify
        commands: ["verify"]
"#;
    let executor = Arc::new(SpyExecutor::new().exit_code("verify", 1));
    let pipeline = pipeline(yaml);

    let result = engine(executor, registry()).execute(&pipeline).await;

    assert!(!result.is_success());
    assert_eq!(result.variables().get("commitId"), None);
    assert!(!result.artifacts().contains("src"));
}
