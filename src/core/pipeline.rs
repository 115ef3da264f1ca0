//! Pipeline domain model

use crate::core::{
    artifact::is_valid_artifact_name,
    config::Settings,
    error::{ActionId, ValidationError},
    stage::{Action, ActionKind, Capability, Stage},
};
use std::collections::{HashMap, HashSet};

/// A validated pipeline definition
///
/// Stage order is fixed once the pipeline is constructed. The only way to
/// obtain a `Pipeline` is through validation, so the engine never sees a
/// malformed definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    name: String,

    /// Variables declared by the definition
    variables: HashMap<String, String>,

    /// Variables supplied by the caller, bound over the declared ones
    overrides: HashMap<String, String>,

    settings: Settings,

    stages: Vec<Stage>,
}

impl Pipeline {
    /// Create a pipeline, validating the definition
    pub fn new(
        name: String,
        variables: HashMap<String, String>,
        settings: Settings,
        stages: Vec<Stage>,
    ) -> Result<Self, ValidationError> {
        let pipeline = Pipeline {
            name,
            variables,
            overrides: HashMap::new(),
            settings,
            stages,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            variables: HashMap::new(),
            settings: Settings::default(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn overrides(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    /// Bind a caller-supplied variable over the declared ones
    pub fn override_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.overrides.insert(key.into(), value.into());
    }

    /// Total number of actions across all stages
    pub fn action_count(&self) -> usize {
        self.stages.iter().map(|s| s.actions.len()).sum()
    }

    /// Every artifact name some action declares as output
    pub fn declared_outputs(&self) -> Vec<&str> {
        self.stages.iter().flat_map(|s| s.outputs()).collect()
    }

    /// Capability handed to collaborators acting for `action`
    pub fn capability_for(&self, action: &Action) -> Capability {
        Capability::new(self.settings.principal.clone(), action.permissions.clone())
    }

    /// Check the definition
    ///
    /// Every input must be produced by a strictly earlier stage, since a
    /// stage's outputs only become visible once the whole stage succeeded.
    fn validate(&self) -> Result<(), ValidationError> {
        if self.stages.is_empty() {
            return Err(ValidationError::NoStages(self.name.clone()));
        }
        self.validate_settings()?;

        let mut stage_names = HashSet::new();
        let mut producers: HashMap<&str, (usize, ActionId)> = HashMap::new();

        for (index, stage) in self.stages.iter().enumerate() {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(ValidationError::DuplicateStage(stage.name.clone()));
            }
            if stage.actions.is_empty() {
                return Err(ValidationError::EmptyStage(stage.name.clone()));
            }

            let mut action_names = HashSet::new();
            for action in &stage.actions {
                let at = ActionId::new(&stage.name, &action.name);
                if !action_names.insert(action.name.as_str()) {
                    return Err(ValidationError::DuplicateAction(at));
                }

                Self::validate_kind(action, &at)?;

                if action.timeout.is_some_and(|t| t.is_zero()) {
                    return Err(ValidationError::ZeroTimeout { at });
                }
                if let Some(name) = action
                    .inputs
                    .iter()
                    .chain(&action.outputs)
                    .find(|name| !is_valid_artifact_name(name))
                {
                    return Err(ValidationError::InvalidArtifactName {
                        at,
                        name: name.clone(),
                    });
                }

                for output in &action.outputs {
                    if let Some((_, first)) = producers.get(output.as_str()) {
                        return Err(ValidationError::DuplicateOutput {
                            name: output.clone(),
                            first: first.clone(),
                            second: at,
                        });
                    }
                    producers.insert(output.as_str(), (index, at.clone()));
                }
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                for input in &action.inputs {
                    let at = ActionId::new(&stage.name, &action.name);
                    match producers.get(input.as_str()) {
                        None => {
                            return Err(ValidationError::UnknownInput {
                                at,
                                name: input.clone(),
                            })
                        }
                        Some((producer_stage, producer)) if *producer_stage >= index => {
                            return Err(ValidationError::ForwardReference {
                                at,
                                name: input.clone(),
                                producer: producer.clone(),
                            })
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_settings(&self) -> Result<(), ValidationError> {
        let settings = &self.settings;
        let reason = if settings.default_timeout_secs == 0 {
            Some("default_timeout_secs must be greater than zero")
        } else if settings.deploy.settle_timeout_secs == 0 {
            Some("deploy.settle_timeout_secs must be greater than zero")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ValidationError::InvalidSettings(reason.to_string())),
            None => Ok(()),
        }
    }

    fn validate_kind(action: &Action, at: &ActionId) -> Result<(), ValidationError> {
        match &action.kind {
            ActionKind::Commands(commands) => {
                if commands.is_empty() || commands.iter().all(|c| c.trim().is_empty()) {
                    return Err(ValidationError::EmptyCommands(at.clone()));
                }
            }
            ActionKind::Source { revision_variable } => {
                let reason = if !action.inputs.is_empty() {
                    Some("source actions take no inputs")
                } else if action.outputs.len() != 1 {
                    Some("source actions declare exactly one output")
                } else if revision_variable.trim().is_empty() {
                    Some("revision variable name is empty")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(ValidationError::InvalidSource {
                        at: at.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
            ActionKind::Deploy { target } => {
                let reason = if action.inputs.len() != 1 {
                    Some("deploy actions consume exactly one template artifact")
                } else if !action.outputs.is_empty() {
                    Some("deploy actions produce no artifacts")
                } else if target.trim().is_empty() {
                    Some("deploy target is empty")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(ValidationError::InvalidDeploy {
                        at: at.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Programmatic construction of a [`Pipeline`]
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    variables: HashMap<String, String>,
    settings: Settings,
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<Pipeline, ValidationError> {
        Pipeline::new(self.name, self.variables, self.settings, self.stages)
    }
}
