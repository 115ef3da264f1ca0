//! Variable bindings and environment templates
//!
//! Variables are bound either by the pipeline definition or by a completed
//! stage (e.g. the source revision). Environment values reference them as
//! `${name}` and are rendered when the referencing stage is entered.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap());

/// Where a binding came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingOrigin {
    /// Declared in the pipeline definition
    Pipeline,
    /// Overridden by the caller (e.g. `--var` on the command line)
    Override,
    /// Published by a completed stage
    Stage(String),
}

/// A bound variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub value: String,
    pub origin: BindingOrigin,
}

/// The variables visible to a stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableScope {
    bindings: BTreeMap<String, Binding>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope seeded with the pipeline's declared variables
    pub fn from_pipeline(variables: &HashMap<String, String>) -> Self {
        let mut scope = Self::new();
        for (name, value) in variables {
            scope.bind(name, value, BindingOrigin::Pipeline);
        }
        scope
    }

    pub fn bind(&mut self, name: &str, value: &str, origin: BindingOrigin) {
        self.bindings.insert(
            name.to_string(),
            Binding {
                value: value.to_string(),
                origin,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(|b| b.value.as_str())
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Plain name -> value view
    pub fn values(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .map(|(k, b)| (k.clone(), b.value.clone()))
            .collect()
    }
}

/// Part of a parsed environment template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Variable(String),
}

/// Malformed `${...}` reference
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid variable reference '${{{0}}}'")]
pub struct TemplateError(pub String);

/// An environment value, parsed once from the definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTemplate {
    segments: Vec<Segment>,
}

impl EnvTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in VAR_REGEX.captures_iter(raw) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if !NAME_REGEX.is_match(name.as_str()) {
                return Err(TemplateError(name.as_str().to_string()));
            }
            if whole.start() > last {
                segments.push(Segment::Literal(raw[last..whole.start()].to_string()));
            }
            segments.push(Segment::Variable(name.as_str().to_string()));
            last = whole.end();
        }

        if last < raw.len() {
            segments.push(Segment::Literal(raw[last..].to_string()));
        }

        Ok(Self { segments })
    }

    /// Names referenced by the template, in order of appearance
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render against a scope; the error names the first unbound variable
    pub fn render(&self, scope: &VariableScope) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    let value = scope.get(name).ok_or_else(|| name.clone())?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for EnvTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => f.write_str(text)?,
                Segment::Variable(name) => write!(f, "${{{}}}", name)?,
            }
        }
        Ok(())
    }
}
