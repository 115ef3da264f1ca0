use anyhow::{Context, Result};
use release_pipeline::backend::{
    FileRegistry, GitSource, RetryPolicy, RetryingRegistry, ShellExecutor, SourceProvider,
    StaticSource,
};
use release_pipeline::cli::commands::{HistoryCommand, ListCommand, RunCommand, ValidateCommand};
use release_pipeline::cli::output::*;
use release_pipeline::cli::{Cli, Command};
use release_pipeline::core::config::PipelineConfig;
use release_pipeline::execution::{ExecutionEngine, ExecutionEvent};
use release_pipeline::persistence::{
    create_summary, InMemoryPersistence, PersistenceBackend, RunOutcome, RunSummary,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => {
            if !run_pipeline(cmd).await? {
                std::process::exit(1);
            }
        }
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("release-pipeline")
}

async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    #[cfg(feature = "sqlite")]
    {
        let store = release_pipeline::persistence::SqliteRunStore::with_default_path()
            .await
            .context("Failed to open run history")?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        tracing::warn!("Built without the sqlite feature; history is not kept across runs");
        Ok(Arc::new(InMemoryPersistence::new()))
    }
}

/// Run a pipeline; `Ok(false)` means the run itself failed
async fn run_pipeline(cmd: &RunCommand) -> Result<bool> {
    let config = PipelineConfig::from_file(&cmd.file)
        .with_context(|| format!("Failed to load pipeline config {}", cmd.file))?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut pipeline = config.to_pipeline()?;

    // Apply variable overrides
    for (key, value) in &cmd.variables {
        pipeline.override_variable(key, value);
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_history().await?
    };

    // Collaborators
    let source: Arc<dyn SourceProvider> = match &cmd.source_revision {
        Some(revision) => Arc::new(StaticSource::new(revision, Vec::<u8>::new())),
        None => Arc::new(GitSource::new(&cmd.source_dir)),
    };

    let workspace_dir = cmd
        .workspace_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("release-pipeline"));
    let executor = ShellExecutor::new(workspace_dir).keep_workspaces(cmd.keep_workspaces);

    let registry_dir = cmd
        .registry_dir
        .clone()
        .unwrap_or_else(|| data_dir().join("units"));
    let registry = FileRegistry::open(&registry_dir)
        .await
        .with_context(|| format!("Failed to open unit registry {}", registry_dir.display()))?;
    let registry = RetryingRegistry::new(registry, RetryPolicy::from(&pipeline.settings().deploy));

    // Console output goes through the progress bar so the two don't interleave
    let progress = create_progress_bar(pipeline.stages().len());
    let bar = progress.clone();
    let mut engine = ExecutionEngine::new(source, Arc::new(executor), Arc::new(registry))
        .with_event_handler(move |event| {
            bar.println(format_execution_event(&event));
            if let ExecutionEvent::StageSucceeded { stage, .. } = &event {
                bar.inc(1);
                bar.set_message(stage.clone());
            }
        });
    if let Some(strategy) = cmd.scheduling_strategy() {
        engine = engine.with_strategy(strategy);
    }

    println!();
    let result = engine.execute(&pipeline).await;
    progress.finish_and_clear();

    // Save to history
    let summary = create_summary(result.state());
    store.save_run(&summary).await?;
    if !cmd.no_history {
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(&summary.run_id.to_string()[..8]).dim()
        );
    }

    println!();
    for (name, state) in result.state().stage_names.iter().zip(&result.state().stages) {
        println!("  {:<24} {}", name, format_stage_state(state));
    }

    // Print final status
    if result.is_success() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(pipeline.name()).bold(),
            style("successfully").green()
        );
        Ok(true)
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(pipeline.name()).bold(),
            style("failed").red()
        );
        if let Some(error) = result.error() {
            error!("{}", error);
            println!("  {}", style(error).red());
        }
        Ok(false)
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            let actions: usize = config.stages.iter().map(|s| s.actions.len()).sum();
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Stages: {}", style(config.stages.len()).cyan());
            println!("  Actions: {}", style(actions).cyan());
            println!("  Variables: {}", style(config.variables.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn list_pipelines(cmd: &ListCommand) -> Result<()> {
    let store = open_history().await?;
    let pipelines = store.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }

    let mut entries = Vec::new();
    for pipeline_name in &pipelines {
        let runs = store.list_runs(pipeline_name).await?;
        let succeeded = runs.iter().filter(|r| r.status == RunOutcome::Succeeded).count();
        let failed = runs.iter().filter(|r| r.status == RunOutcome::Failed).count();
        entries.push((pipeline_name, runs.len(), succeeded, failed));
    }

    if cmd.json {
        let data: Vec<_> = entries
            .iter()
            .map(|(name, runs, succeeded, failed)| {
                serde_json::json!({
                    "name": name,
                    "run_count": runs,
                    "succeeded": succeeded,
                    "failed": failed,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "pipelines": data }))?
        );
        return Ok(());
    }

    println!("{} Pipelines in history:", INFO);
    for (name, runs, succeeded, failed) in &entries {
        if cmd.with_counts {
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(name).bold(),
                style(runs).cyan(),
                style(succeeded).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(name).bold());
        }
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    // If a specific run is requested
    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary, cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    // List runs for one pipeline or all
    let mut runs = if let Some(pipeline_name) = &cmd.pipeline {
        store.list_runs(pipeline_name).await?
    } else {
        let mut all = Vec::new();
        for pipeline in store.list_pipelines().await? {
            all.extend(store.list_runs(&pipeline).await?);
        }
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    };
    runs.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(finished) = summary.finished_at {
        println!("  Finished: {}", style(finished.to_rfc3339()).dim());
        if let Ok(duration) = finished.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{} stages)",
        style(format!("{:.0}%", summary.progress * 100.0)).cyan(),
        summary.completed_stages,
        summary.total_stages
    );
    if let (Some(stage), Some(action)) = (&summary.failed_stage, &summary.failed_action) {
        println!("  Failed at: {}", style(format!("{}/{}", stage, action)).red());
    }
    if let Some(error) = &summary.error {
        println!("  Error: {}", style(error).red());
    }
    for (name, value) in &summary.variables {
        println!("  {} = {}", style(name).cyan(), value);
    }
    for artifact in &summary.artifacts {
        println!(
            "  {} {} ({} bytes)",
            PACKAGE,
            style(&artifact.name).bold(),
            artifact.size
        );
    }

    Ok(())
}
