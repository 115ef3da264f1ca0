//! CLI output formatting

use crate::{
    backend::UpsertOutcome,
    core::{RunStatus, StageState},
    execution::ExecutionEvent,
    persistence::{RunOutcome, RunSummary},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "+ ");

/// Create a progress bar over the stages of a run
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a stage state for display
pub fn format_stage_state(state: &StageState) -> String {
    match state {
        StageState::Pending => style("PENDING").dim().to_string(),
        StageState::Running { .. } => style("RUNNING").yellow().to_string(),
        StageState::Succeeded { .. } => style("SUCCEEDED").green().to_string(),
        StageState::Failed { .. } => style("FAILED").red().to_string(),
        StageState::Skipped { .. } => style("SKIPPED").dim().to_string(),
    }
}

/// Format a recorded run status for display
pub fn format_status(status: RunOutcome) -> String {
    match status {
        RunOutcome::Pending => style("PENDING").dim().to_string(),
        RunOutcome::Running => style("RUNNING").yellow().to_string(),
        RunOutcome::Succeeded => style("SUCCEEDED").green().to_string(),
        RunOutcome::Failed => style("FAILED").red().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a run summary as a single history line
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunOutcome::Succeeded => CHECK,
        RunOutcome::Failed => CROSS,
        RunOutcome::Running => SPINNER,
        RunOutcome::Pending => INFO,
    };

    let failure = match (&summary.failed_stage, &summary.failed_action) {
        (Some(stage), Some(action)) => format!(" at {}/{}", stage, action),
        _ => String::new(),
    };

    format!(
        "{} {} - {} - {}{} ({}/{}) - {}",
        status_icon,
        style(short_id(&summary.run_id)).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        style(failure).red(),
        summary.completed_stages,
        summary.total_stages,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline_name,
            stages,
        } => format!(
            "{} Starting pipeline {} ({}, {} stages)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(run_id)).dim(),
            stages
        ),
        ExecutionEvent::StageStarted {
            index,
            stage,
            actions,
        } => format!(
            "{} Stage {} {} ({} actions)",
            SPINNER,
            style(index + 1).dim(),
            style(stage).cyan().bold(),
            actions
        ),
        ExecutionEvent::ActionStarted { action } => {
            format!("   {} {}", SPINNER, style(action).cyan())
        }
        ExecutionEvent::ActionSucceeded { action } => {
            format!("   {} {}", CHECK, style(action).green())
        }
        ExecutionEvent::ActionFailed { action, error } => format!(
            "   {} {}: {}",
            CROSS,
            style(action).red(),
            style(error).dim()
        ),
        ExecutionEvent::ActionSkipped { action } => {
            format!("   {} {} (skipped)", WARN, style(action).dim())
        }
        ExecutionEvent::ArtifactPublished { reference, .. } => {
            let digest = reference.digest.get(..12).unwrap_or(&reference.digest);
            format!(
                "   {} {} {}",
                PACKAGE,
                style(&reference.name).bold(),
                style(format!("{} bytes, sha256:{}", reference.size, digest)).dim()
            )
        }
        ExecutionEvent::VariableBound { name, value, .. } => format!(
            "   {} {} = {}",
            INFO,
            style(name).cyan(),
            style(value).dim()
        ),
        ExecutionEvent::UnitDeployed { result, .. } => {
            let outcome = match result.outcome {
                UpsertOutcome::Created => style("created").green(),
                UpsertOutcome::Updated => style("updated").green(),
                UpsertOutcome::Unchanged => style("unchanged").dim(),
            };
            format!(
                "   {} {} {}",
                ROCKET,
                style(&result.target).bold(),
                outcome
            )
        }
        ExecutionEvent::StageSucceeded { stage, .. } => {
            format!("{} Stage {} succeeded", CHECK, style(stage).green())
        }
        ExecutionEvent::StageFailed { stage, .. } => {
            format!("{} Stage {} failed", CROSS, style(stage).red())
        }
        ExecutionEvent::StageSkipped { stage, .. } => {
            format!("{} Stage {} skipped", WARN, style(stage).dim())
        }
        ExecutionEvent::PipelineFinished { run_id, status } => {
            let status_str = match status {
                RunStatus::Succeeded => format!("{} completed", style("successfully").green()),
                RunStatus::Failed { .. } => style("failed").red().to_string(),
                other => format!("{:?}", other),
            };
            format!(
                "{} Pipeline ({}) {}",
                INFO,
                style(short_id(run_id)).dim(),
                status_str
            )
        }
    }
}

/// Format a duration as `1h 2m 3s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
