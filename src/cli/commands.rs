//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;
use tracing::warn;

/// Default concurrency cap when `--strategy limited` is given without `--max-parallel`
const DEFAULT_MAX_PARALLEL: usize = 4;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Variable overrides (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variables: Vec<(String, String)>,

    /// Scheduling strategy (defaults to the pipeline settings)
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Concurrency cap; implies `--strategy limited` when no strategy is given
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Directory of deployed units (defaults to the local data directory)
    #[arg(long)]
    pub registry_dir: Option<PathBuf>,

    /// Directory action workspaces are created in
    #[arg(long)]
    pub workspace_dir: Option<PathBuf>,

    /// Keep action workspaces after the run
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Git checkout source actions snapshot
    #[arg(long, default_value = ".")]
    pub source_dir: PathBuf,

    /// Use a fixed, empty snapshot with this revision instead of git
    #[arg(long)]
    pub source_revision: Option<String>,
}

impl RunCommand {
    /// Strategy requested on the command line, if any
    pub fn scheduling_strategy(&self) -> Option<SchedulingStrategy> {
        let limited = |cap: Option<usize>| {
            SchedulingStrategy::LimitedParallel(cap.unwrap_or(DEFAULT_MAX_PARALLEL))
        };
        if let (Some(StrategyArg::Sequential | StrategyArg::Parallel), Some(cap)) =
            (self.strategy, self.max_parallel)
        {
            warn!("--max-parallel {} has no effect with this strategy", cap);
        }
        match (self.strategy, self.max_parallel) {
            (Some(StrategyArg::Sequential), _) => Some(SchedulingStrategy::Sequential),
            (Some(StrategyArg::Parallel), _) => Some(SchedulingStrategy::Parallel),
            (Some(StrategyArg::Limited), cap) => Some(limited(cap)),
            (None, Some(cap)) => Some(limited(Some(cap))),
            (None, None) => None,
        }
    }
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StrategyArg {
    Sequential,
    Parallel,
    Limited,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
