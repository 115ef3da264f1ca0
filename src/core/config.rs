//! Pipeline configuration from YAML

use crate::core::{
    context::EnvTemplate,
    error::{ActionId, ValidationError},
    stage::{Action, ActionKind, Stage, DEFAULT_REVISION_VARIABLE},
    Pipeline,
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading a pipeline definition
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid pipeline: {0}")]
    Invalid(#[from] ValidationError),
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Variables visible to every stage
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Execution settings
    #[serde(default)]
    pub settings: Settings,

    /// Stages, in execution order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

/// Action configuration as defined in YAML
///
/// Exactly one of `commands`, `source` or `deploy` must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Environment bindings; values may reference variables as `${name}`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,

    /// Timeout for this action (overrides the pipeline default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Permission scopes granted to the action
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Source checkout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Variable the revision identifier is bound to
    #[serde(default = "default_revision_variable")]
    pub revision_variable: String,
}

fn default_revision_variable() -> String {
    DEFAULT_REVISION_VARIABLE.to_string()
}

/// Deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Name of the deployable unit to create or update
    pub target: String,
}

/// Intra-stage dispatch mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Parallel,
    Limited,
}

/// Pipeline-wide execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-action timeout unless the action sets its own
    pub default_timeout_secs: u64,

    /// How actions within a stage are dispatched
    pub strategy: StrategyKind,

    /// Concurrency cap for the `limited` strategy
    pub max_parallel: usize,

    /// Principal named in every action capability
    pub principal: String,

    pub deploy: DeploySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3600,
            strategy: StrategyKind::Sequential,
            max_parallel: 4,
            principal: "pipeline".to_string(),
            deploy: DeploySettings::default(),
        }
    }
}

impl Settings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Deployment gate and retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Interval between status polls while a unit settles
    pub poll_interval_ms: u64,

    /// How long a unit may take to become stable
    pub settle_timeout_secs: u64,

    /// Upsert attempts (1 = no retry)
    pub max_attempts: u32,

    /// Initial retry backoff, doubled after every failed attempt
    pub backoff_ms: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            settle_timeout_secs: 600,
            max_attempts: 1,
            backoff_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate pipeline configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the definition without keeping the result
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.to_pipeline().map(|_| ())
    }

    /// Variables rendered as strings
    pub fn variables_as_string_map(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .map(|(key, value)| (key.clone(), render_scalar(value)))
            .collect()
    }

    /// Convert config to a validated Pipeline
    pub fn to_pipeline(&self) -> Result<Pipeline, ValidationError> {
        let stages = self
            .stages
            .iter()
            .map(|stage| {
                let actions = stage
                    .actions
                    .iter()
                    .map(|action| action.to_action(&stage.name))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage {
                    name: stage.name.clone(),
                    actions,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        Pipeline::new(
            self.name.clone(),
            self.variables_as_string_map(),
            self.settings.clone(),
            stages,
        )
    }
}

impl ActionConfig {
    fn to_action(&self, stage: &str) -> Result<Action, ValidationError> {
        let at = ActionId::new(stage, &self.name);

        let kind = match (&self.commands, &self.source, &self.deploy) {
            (Some(commands), None, None) => ActionKind::Commands(commands.clone()),
            (None, Some(source), None) => ActionKind::Source {
                revision_variable: source.revision_variable.clone(),
            },
            (None, None, Some(deploy)) => ActionKind::Deploy {
                target: deploy.target.clone(),
            },
            _ => return Err(ValidationError::AmbiguousKind { at }),
        };

        let env = self
            .env
            .iter()
            .map(|(key, raw)| {
                EnvTemplate::parse(raw)
                    .map(|template| (key.clone(), template))
                    .map_err(|e| ValidationError::InvalidEnv {
                        at: at.clone(),
                        key: key.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Action {
            name: self.name.clone(),
            kind,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            env,
            timeout: self.timeout_secs.map(Duration::from_secs),
            permissions: self.permissions.clone(),
        })
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
