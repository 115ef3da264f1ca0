//! Deployable-unit registries

use crate::backend::{BackendError, DeployedUnit, UnitRegistry, UnitStatus, UpsertOutcome};
use crate::core::{Capability, Payload};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Compute the unit that results from upserting `template`
fn apply_upsert(
    existing: Option<&DeployedUnit>,
    name: &str,
    template: &serde_json::Value,
    capability: &Capability,
) -> (DeployedUnit, UpsertOutcome) {
    let digest = Payload::Document(template.clone()).digest();

    match existing {
        Some(unit) if unit.digest == digest => (unit.clone(), UpsertOutcome::Unchanged),
        Some(unit) => (
            DeployedUnit {
                name: name.to_string(),
                template: template.clone(),
                digest,
                generation: unit.generation + 1,
                deployed_by: capability.principal.clone(),
                updated_at: Utc::now(),
            },
            UpsertOutcome::Updated,
        ),
        None => (
            DeployedUnit {
                name: name.to_string(),
                template: template.clone(),
                digest,
                generation: 1,
                deployed_by: capability.principal.clone(),
                updated_at: Utc::now(),
            },
            UpsertOutcome::Created,
        ),
    }
}

fn check_scope(enforce: bool, name: &str, capability: &Capability) -> Result<(), BackendError> {
    let scope = format!("deploy:{}", name);
    if enforce && !capability.allows(&scope) {
        return Err(BackendError::Denied(format!(
            "{} lacks scope {}",
            capability.principal, scope
        )));
    }
    Ok(())
}

/// Registry kept in memory (for testing or ephemeral use)
///
/// A changed unit reports `Settling` for a configurable number of status
/// polls before it turns `Stable`.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    units: RwLock<HashMap<String, DeployedUnit>>,
    settling: RwLock<HashMap<String, u32>>,
    settle_polls: u32,
    enforce_scopes: bool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Settling` this many times after every change
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Require `deploy:<name>` in the capability of every upsert
    pub fn enforce_scopes(mut self) -> Self {
        self.enforce_scopes = true;
        self
    }

    pub async fn len(&self) -> usize {
        self.units.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.units.read().await.is_empty()
    }
}

#[async_trait]
impl UnitRegistry for InMemoryRegistry {
    async fn upsert(
        &self,
        name: &str,
        template: &serde_json::Value,
        capability: &Capability,
    ) -> Result<UpsertOutcome, BackendError> {
        check_scope(self.enforce_scopes, name, capability)?;

        let mut units = self.units.write().await;
        let (unit, outcome) = apply_upsert(units.get(name), name, template, capability);
        if outcome != UpsertOutcome::Unchanged {
            units.insert(name.to_string(), unit);
            self.settling
                .write()
                .await
                .insert(name.to_string(), self.settle_polls);
        }

        debug!("Upserted unit {}: {:?}", name, outcome);
        Ok(outcome)
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, BackendError> {
        if !self.units.read().await.contains_key(name) {
            return Ok(UnitStatus::Missing);
        }

        let mut settling = self.settling.write().await;
        match settling.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(UnitStatus::Settling)
            }
            _ => Ok(UnitStatus::Stable),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<DeployedUnit>, BackendError> {
        Ok(self.units.read().await.get(name).cloned())
    }
}

/// Registry persisting one JSON document per unit
///
/// A unit is replaced by writing a temporary file and renaming it over the
/// previous one, so a failed write leaves the deployed unit untouched.
#[derive(Debug)]
pub struct FileRegistry {
    dir: PathBuf,
    enforce_scopes: bool,
    // serializes read-modify-write cycles within the process
    lock: tokio::sync::Mutex<()>,
}

impl FileRegistry {
    /// Open (and create if needed) a registry directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            enforce_scopes: false,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Require `deploy:<name>` in the capability of every upsert
    pub fn enforce_scopes(mut self) -> Self {
        self.enforce_scopes = true;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Hex keeps distinct unit names in distinct files whatever they contain.
    fn unit_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(name)))
    }

    async fn read_unit(&self, name: &str) -> Result<Option<DeployedUnit>, BackendError> {
        let bytes = match tokio::fs::read(self.unit_path(name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let unit: DeployedUnit = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::Internal(format!("corrupt unit {}: {}", name, e)))?;
        if unit.name != name {
            return Err(BackendError::Internal(format!(
                "unit file for {} holds unit {}",
                name, unit.name
            )));
        }
        Ok(Some(unit))
    }
}

#[async_trait]
impl UnitRegistry for FileRegistry {
    async fn upsert(
        &self,
        name: &str,
        template: &serde_json::Value,
        capability: &Capability,
    ) -> Result<UpsertOutcome, BackendError> {
        check_scope(self.enforce_scopes, name, capability)?;
        let _guard = self.lock.lock().await;

        let existing = self.read_unit(name).await?;
        let (unit, outcome) = apply_upsert(existing.as_ref(), name, template, capability);
        if outcome == UpsertOutcome::Unchanged {
            return Ok(outcome);
        }

        let bytes = serde_json::to_vec_pretty(&unit)
            .map_err(|e| BackendError::Internal(e.to_string()))?;
        let path = self.unit_path(name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Wrote unit {} to {}", name, path.display());
        Ok(outcome)
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, BackendError> {
        Ok(match self.read_unit(name).await? {
            Some(_) => UnitStatus::Stable,
            None => UnitStatus::Missing,
        })
    }

    async fn get(&self, name: &str) -> Result<Option<DeployedUnit>, BackendError> {
        self.read_unit(name).await
    }
}
