//! Error taxonomy for definition and execution

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of an action within a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId {
    pub stage: String,
    pub action: String,
}

impl ActionId {
    pub fn new(stage: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.action)
    }
}

/// A malformed pipeline definition, detected before any stage runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pipeline '{0}' has no stages")]
    NoStages(String),

    #[error("stage '{0}' has no actions")]
    EmptyStage(String),

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("duplicate action {0}")]
    DuplicateAction(ActionId),

    #[error("output '{name}' is declared by both {first} and {second}")]
    DuplicateOutput {
        name: String,
        first: ActionId,
        second: ActionId,
    },

    #[error("{at}: invalid artifact name '{name}' (allowed: letters, digits, '_', '.', '-')")]
    InvalidArtifactName { at: ActionId, name: String },

    #[error("{at} consumes '{name}', which no action produces")]
    UnknownInput { at: ActionId, name: String },

    #[error("{at} consumes '{name}' before it is produced (by {producer})")]
    ForwardReference {
        at: ActionId,
        name: String,
        producer: ActionId,
    },

    #[error("{0} has an empty command list")]
    EmptyCommands(ActionId),

    #[error("{at} must declare exactly one of commands, source or deploy")]
    AmbiguousKind { at: ActionId },

    #[error("{at}: {reason}")]
    InvalidSource { at: ActionId, reason: String },

    #[error("{at}: {reason}")]
    InvalidDeploy { at: ActionId, reason: String },

    #[error("{at}: timeout must be greater than zero")]
    ZeroTimeout { at: ActionId },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{at}: environment variable '{key}': {reason}")]
    InvalidEnv {
        at: ActionId,
        key: String,
        reason: String,
    },
}

/// What kind of input could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    Artifact,
    Variable,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Artifact => f.write_str("artifact"),
            InputKind::Variable => f.write_str("variable"),
        }
    }
}

/// A failure while a run is executing
///
/// Every variant names the action it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RunError {
    #[error("{at}: missing input {kind} '{name}'")]
    MissingInput {
        at: ActionId,
        kind: InputKind,
        name: String,
    },

    #[error("{at}: command #{index} `{command}` exited with code {code}")]
    CommandFailed {
        at: ActionId,
        index: usize,
        command: String,
        code: i32,
    },

    #[error("{at}: deployment of '{target}' failed: {reason}")]
    UpsertFailed {
        at: ActionId,
        target: String,
        reason: String,
    },

    #[error("{at}: timed out after {secs} seconds")]
    TimedOut { at: ActionId, secs: u64 },

    #[error("{at}: declared output '{name}' was not produced")]
    OutputMissing { at: ActionId, name: String },

    #[error("{at}: artifact '{name}' was already written in this run")]
    ArtifactConflict { at: ActionId, name: String },

    #[error("{at}: {message}")]
    Backend { at: ActionId, message: String },
}

impl RunError {
    /// The action the error is attributed to
    pub fn action(&self) -> &ActionId {
        match self {
            RunError::MissingInput { at, .. }
            | RunError::CommandFailed { at, .. }
            | RunError::UpsertFailed { at, .. }
            | RunError::TimedOut { at, .. }
            | RunError::OutputMissing { at, .. }
            | RunError::ArtifactConflict { at, .. }
            | RunError::Backend { at, .. } => at,
        }
    }
}
