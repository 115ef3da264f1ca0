//! Test: Failure Handling - a failing action stops the run at its stage

use crate::helpers::*;
use release_pipeline::core::config::{ConfigError, PipelineConfig};
use release_pipeline::core::{RunError, RunStatus, ValidationError};
use release_pipeline::execution::{ExecutionEvent, SchedulingStrategy};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_failed_unit_tests_stop_the_release() {
    let executor = Arc::new(
        SpyExecutor::new()
            .produce("template", template_payload())
            .exit_code("run_tests", 2),
    );
    let registry = registry();
    let pipeline = pipeline(&release_yaml());

    let engine = engine(executor.clone(), registry.clone());
    let (result, events) = run_with_events(engine, &pipeline).await;

    assert!(!result.is_success());
    assert_eq!(result.status(), &RunStatus::Failed { stage: 1 });
    match result.error() {
        Some(RunError::CommandFailed { at, index, command, code }) => {
            assert_eq!(at.to_string(), "Unittest/unit");
            assert_eq!(*index, 0);
            assert_eq!(command, "run_tests");
            assert_eq!(*code, 2);
        }
        other => panic!("expected CommandFailed, got {:?}", other),
    }
    assert_eq!(result.failed_action().unwrap().to_string(), "Unittest/unit");

    assert_stage_states(
        &result,
        &[
            ("Source", "succeeded"),
            ("Unittest", "failed"),
            ("Build", "skipped"),
            ("DeployStaging", "skipped"),
            ("IntegTest", "skipped"),
            ("DeployProd", "skipped"),
        ],
    );

    // Nothing after the failing stage was invoked
    for stage in ["Build", "DeployStaging", "IntegTest", "DeployProd"] {
        assert!(!executor.ran_in_stage(stage), "{} ran after the failure", stage);
    }
    assert!(registry.is_empty().await);
    assert!(!result.artifacts().contains("bin"));

    let skipped = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::StageSkipped { .. }))
        .count();
    assert_eq!(skipped, 4);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::PipelineFinished { status: RunStatus::Failed { stage: 1 }, .. })
    ));
}

#[tokio::test]
async fn test_commands_are_fail_fast() {
    let executor = Arc::new(SpyExecutor::new().exit_code("compile", 1));
    let pipeline = pipeline(&release_yaml());

    let result = engine(executor.clone(), registry()).execute(&pipeline).await;

    assert!(matches!(
        result.error(),
        Some(RunError::CommandFailed { index: 0, .. })
    ));
    assert!(!executor.commands().contains(&"Build/package:render_template".to_string()));
    // The failed action's workspace is released too
    assert_eq!(executor.released(), 2);
}

#[tokio::test]
async fn test_missing_output_fails_the_producing_stage() {
    let executor = Arc::new(SpyExecutor::new().withhold("bin"));
    let pipeline = pipeline(&release_yaml());

    let result = engine(executor.clone(), registry()).execute(&pipeline).await;

    match result.error() {
        Some(RunError::OutputMissing { at, name }) => {
            assert_eq!(at.to_string(), "Build/package");
            assert_eq!(name, "bin");
        }
        other => panic!("expected OutputMissing, got {:?}", other),
    }
    // Build published nothing, not even the output that was produced
    assert!(!result.artifacts().contains("template"));
    assert!(!executor.ran_in_stage("IntegTest"));
}

const WIDE_STAGE: &str = r#"
name: "Wide"
stages:
  - name: Checks
    actions:
      - name: lint
        outputs: [lint_report]
        commands: ["lint"]
      - name: audit
        outputs: [audit_report]
        commands: ["audit"]
      - name: docs
        outputs: [docs]
        commands: ["docs"]
  - name: After
    actions:
      - name: report
        inputs: [lint_report]
        commands: ["report"]
"#;

#[tokio::test]
async fn test_sequential_failure_skips_remaining_actions() {
    let executor = Arc::new(SpyExecutor::new().exit_code("audit", 1));
    let pipeline = pipeline(WIDE_STAGE);

    let (result, events) = run_with_events(
        engine(executor.clone(), registry()).with_strategy(SchedulingStrategy::Sequential),
        &pipeline,
    )
    .await;

    assert_eq!(executor.commands(), vec!["Checks/lint:lint", "Checks/audit:audit"]);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::ActionSkipped { action } if action.to_string() == "Checks/docs"
    )));
    // lint succeeded but its stage failed, so its report was never published
    assert!(!result.artifacts().contains("lint_report"));
    assert!(!executor.ran_in_stage("After"));
}

#[tokio::test]
async fn test_parallel_failure_discards_sibling_outputs() {
    let executor = Arc::new(
        SpyExecutor::new()
            .delay("lint", Duration::from_millis(100))
            .exit_code("audit", 1),
    );
    let pipeline = pipeline(WIDE_STAGE);

    let result = engine(executor.clone(), registry())
        .with_strategy(SchedulingStrategy::Parallel)
        .execute(&pipeline)
        .await;

    // lint was already running when audit failed and was allowed to finish
    assert!(executor.commands().contains(&"Checks/lint:lint".to_string()));
    assert_eq!(result.failed_action().unwrap().to_string(), "Checks/audit");
    assert!(result.artifacts().is_empty());
}

#[tokio::test]
async fn test_first_failure_in_declared_order_is_reported() {
    let executor = Arc::new(
        SpyExecutor::new()
            .delay("lint", Duration::from_millis(100))
            .exit_code("lint", 3)
            .exit_code("audit", 4),
    );
    let pipeline = pipeline(WIDE_STAGE);

    let result = engine(executor, registry())
        .with_strategy(SchedulingStrategy::Parallel)
        .execute(&pipeline)
        .await;

    // audit fails first in time, lint first in declaration
    assert!(matches!(
        result.error(),
        Some(RunError::CommandFailed { code: 3, .. })
    ));
    assert_eq!(result.failed_action().unwrap().to_string(), "Checks/lint");
}

#[tokio::test]
async fn test_timeout_fails_action_and_releases_workspace() {
    let yaml = r#"
name: "Slow"
stages:
  - name: Build
    actions:
      - name: slow
        timeout_secs: 1
        commands: ["hang"]
"#;
    let executor = Arc::new(SpyExecutor::new().delay("hang", Duration::from_secs(5)));
    let pipeline = pipeline(yaml);

    let result = engine(executor.clone(), registry()).execute(&pipeline).await;

    match result.error() {
        Some(RunError::TimedOut { at, secs }) => {
            assert_eq!(at.to_string(), "Build/slow");
            assert_eq!(*secs, 1);
        }
        other => panic!("expected TimedOut, got {:?}", other),
    }
    assert_eq!(executor.released(), 1);
}

#[test]
fn test_duplicate_output_is_rejected_before_running() {
    let yaml = r#"
name: "Clash"
stages:
  - name: Build
    actions:
      - name: a
        outputs: [bin]
        commands: ["make a"]
  - name: Rebuild
    actions:
      - name: b
        outputs: [bin]
        commands: ["make b"]
"#;
    let err = PipelineConfig::from_yaml(yaml).unwrap_err();

    assert!(matches!(
        err,
        ConfigError::Invalid(ValidationError::DuplicateOutput { ref name, .. }) if name == "bin"
    ));
}

#[test]
fn test_input_from_a_later_stage_is_rejected() {
    let yaml = r#"
name: "Backwards"
stages:
  - name: Test
    actions:
      - name: test
        inputs: [bin]
        commands: ["test"]
  - name: Build
    actions:
      - name: build
        outputs: [bin]
        commands: ["make"]
"#;
    let err = PipelineConfig::from_yaml(yaml).unwrap_err();

    assert!(matches!(
        err,
        ConfigError::Invalid(ValidationError::ForwardReference { .. })
    ));
}
