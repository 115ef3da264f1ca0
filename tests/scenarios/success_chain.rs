//! Test: Success Chain - the reference release runs every stage in order

use crate::helpers::*;
use release_pipeline::backend::{UnitRegistry, UnitStatus, UpsertOutcome};
use release_pipeline::core::{BindingOrigin, RunStatus};
use release_pipeline::execution::ExecutionEvent;
use std::sync::Arc;

#[tokio::test]
async fn test_release_runs_all_stages() {
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let registry = registry();
    let pipeline = pipeline(&release_yaml());

    let engine = engine(executor.clone(), registry.clone());
    let (result, events) = run_with_events(engine, &pipeline).await;

    assert!(result.is_success(), "run failed: {:?}", result.error());
    assert_eq!(result.status(), &RunStatus::Succeeded);
    assert_stage_states(
        &result,
        &[
            ("Source", "succeeded"),
            ("Unittest", "succeeded"),
            ("Build", "succeeded"),
            ("DeployStaging", "succeeded"),
            ("IntegTest", "succeeded"),
            ("DeployProd", "succeeded"),
        ],
    );

    // Commands ran in declared order, one stage after the other
    assert_eq!(
        executor.commands(),
        vec![
            "Unittest/unit:run_tests",
            "Build/package:compile",
            "Build/package:render_template",
            "IntegTest/integ:run_integ_tests",
        ]
    );
    assert_eq!(executor.released(), 3);

    // Every declared output was published
    for name in ["src", "bin", "template"] {
        assert!(result.artifacts().contains(name), "missing artifact {}", name);
    }

    // Source bound the revision for later stages
    let binding = result.variables().binding("commitId").unwrap();
    assert_eq!(binding.value, "c0ffee");
    assert_eq!(binding.origin, BindingOrigin::Stage("Source".to_string()));

    // Both units exist and are stable
    for target in ["service-staging", "service-prod"] {
        assert_eq!(registry.status(target).await.unwrap(), UnitStatus::Stable);
        assert!(registry.get(target).await.unwrap().is_some());
    }

    let deployments: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::UnitDeployed { result, .. } => {
                Some((result.target.clone(), result.outcome))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        deployments,
        vec![
            ("service-staging".to_string(), UpsertOutcome::Created),
            ("service-prod".to_string(), UpsertOutcome::Created),
        ]
    );
}

#[tokio::test]
async fn test_stages_never_overlap() {
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let pipeline = pipeline(&release_yaml());

    let (_, events) = run_with_events(engine(executor, registry()), &pipeline).await;

    // Between a StageStarted and its terminal event no other stage starts
    let mut open: Option<usize> = None;
    for event in &events {
        match event {
            ExecutionEvent::StageStarted { index, .. } => {
                assert!(open.is_none(), "stage {} started while {:?} was open", index, open);
                open = Some(*index);
            }
            ExecutionEvent::StageSucceeded { index, .. }
            | ExecutionEvent::StageFailed { index, .. } => {
                assert_eq!(open, Some(*index));
                open = None;
            }
            _ => {}
        }
    }
    assert!(open.is_none());
}

#[tokio::test]
async fn test_artifacts_published_after_stage_actions_finish() {
    let executor = Arc::new(SpyExecutor::new().produce("template", template_payload()));
    let pipeline = pipeline(&release_yaml());

    let (_, events) = run_with_events(engine(executor, registry()), &pipeline).await;

    let position = |pred: &dyn Fn(&ExecutionEvent) -> bool| events.iter().position(pred).unwrap();
    let package_done = position(&|e: &ExecutionEvent| {
        matches!(
            e,
            ExecutionEvent::ActionSucceeded { action } if action.to_string() == "Build/package"
        )
    });
    let bin_published = position(&|e: &ExecutionEvent| {
        matches!(e, ExecutionEvent::ArtifactPublished { reference, .. } if reference.name == "bin")
    });
    let build_done = position(&|e: &ExecutionEvent| {
        matches!(e, ExecutionEvent::StageSucceeded { stage, .. } if stage == "Build")
    });

    assert!(package_done < bin_published);
    assert!(bin_published < build_done);
}
