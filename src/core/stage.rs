//! Stage and action domain model

use crate::core::context::EnvTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Variable the source revision is bound to unless configured otherwise
pub const DEFAULT_REVISION_VARIABLE: &str = "commitId";

/// A named, sequential phase of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Every output declared by the stage's actions
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| a.outputs.iter().map(String::as_str))
    }
}

/// What an action does when it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Run commands, in order, through the build executor
    Commands(Vec<String>),
    /// Take a snapshot from the source provider
    Source { revision_variable: String },
    /// Upsert a deployable unit from the (single) input template
    Deploy { target: String },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Commands(_) => "commands",
            ActionKind::Source { .. } => "source",
            ActionKind::Deploy { .. } => "deploy",
        }
    }
}

/// The smallest unit of declared work
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,

    /// Artifact names consumed; must be produced by an earlier stage
    pub inputs: Vec<String>,

    /// Artifact names produced; write-once per run
    pub outputs: Vec<String>,

    /// Environment bindings, rendered at stage entry
    pub env: BTreeMap<String, EnvTemplate>,

    /// Overrides the pipeline default when set
    pub timeout: Option<Duration>,

    /// Permission scopes granted to this action's collaborators
    pub permissions: Vec<String>,
}

impl Action {
    fn with_kind(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
            permissions: Vec::new(),
        }
    }

    pub fn commands<I, S>(name: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            name,
            ActionKind::Commands(commands.into_iter().map(Into::into).collect()),
        )
    }

    /// Source checkout producing `output` and binding the revision to `commitId`
    pub fn source(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            ActionKind::Source {
                revision_variable: DEFAULT_REVISION_VARIABLE.to_string(),
            },
        )
        .output(output)
    }

    /// Deployment of the `template` artifact to `target`
    pub fn deploy(
        name: impl Into<String>,
        template: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            ActionKind::Deploy {
                target: target.into(),
            },
        )
        .input(template)
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: EnvTemplate) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn permit(mut self, scope: impl Into<String>) -> Self {
        self.permissions.push(scope.into());
        self
    }

    /// Rename the variable a source action binds the revision to
    pub fn revision_variable(mut self, variable: impl Into<String>) -> Self {
        if let ActionKind::Source { revision_variable } = &mut self.kind {
            *revision_variable = variable.into();
        }
        self
    }
}

/// Explicit grant handed to collaborators acting for an action
///
/// The engine does not evaluate it; collaborators decide what the scopes
/// allow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub principal: String,
    pub scopes: Vec<String>,
}

impl Capability {
    pub fn new(principal: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            principal: principal.into(),
            scopes,
        }
    }

    pub fn allows(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| {
            s == scope
                || s.strip_suffix('*')
                    .is_some_and(|prefix| scope.starts_with(prefix))
        })
    }
}
