//! Deployment gate - upserts a unit and waits for it to settle

use crate::backend::{UnitRegistry, UnitStatus, UpsertOutcome};
use crate::core::config::DeploySettings;
use crate::core::{ActionId, Artifact, Capability, Payload, RunError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Result of a successful deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub target: String,
    pub outcome: UpsertOutcome,
    /// Digest of the template that was applied
    pub digest: String,
}

/// Applies deployable-unit templates through a registry
///
/// A deployment succeeds only once the registry reports the unit stable. The
/// registry is responsible for leaving the previous unit in place when an
/// upsert fails.
#[derive(Clone)]
pub struct DeploymentGate {
    registry: Arc<dyn UnitRegistry>,
    poll_interval: Duration,
    settle_timeout: Duration,
}

impl DeploymentGate {
    pub fn new(registry: Arc<dyn UnitRegistry>, settings: &DeploySettings) -> Self {
        Self {
            registry,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            settle_timeout: Duration::from_secs(settings.settle_timeout_secs),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_settle_timeout(mut self, limit: Duration) -> Self {
        self.settle_timeout = limit;
        self
    }

    /// Deploy `template` to `target`
    pub async fn deploy(
        &self,
        at: &ActionId,
        template: &Artifact,
        target: &str,
        capability: &Capability,
    ) -> Result<DeployResult, RunError> {
        let failed = |reason: String| RunError::UpsertFailed {
            at: at.clone(),
            target: target.to_string(),
            reason,
        };

        let document = Self::parse_template(&template.payload).map_err(failed)?;
        let digest = Payload::Document(document.clone()).digest();

        info!("Deploying {} to {} ({})", template.name(), target, digest);
        let outcome = self
            .registry
            .upsert(target, &document, capability)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if outcome == UpsertOutcome::Unchanged {
            debug!("Unit {} already runs {}", target, digest);
        }

        match timeout(self.settle_timeout, self.wait_stable(target)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(failed(reason)),
            Err(_) => {
                warn!("Unit {} did not settle in {:?}", target, self.settle_timeout);
                return Err(failed(format!(
                    "unit did not become stable within {} seconds",
                    self.settle_timeout.as_secs()
                )));
            }
        }

        info!("Unit {} is stable ({:?})", target, outcome);
        Ok(DeployResult {
            target: target.to_string(),
            outcome,
            digest,
        })
    }

    async fn wait_stable(&self, target: &str) -> Result<(), String> {
        loop {
            match self.registry.status(target).await {
                Ok(UnitStatus::Stable) => return Ok(()),
                Ok(UnitStatus::Settling) => {
                    debug!("Unit {} settling", target);
                    sleep(self.poll_interval).await;
                }
                Ok(UnitStatus::Failed(reason)) => return Err(reason),
                Ok(UnitStatus::Missing) => {
                    return Err("unit disappeared after upsert".to_string())
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Templates arrive either as documents or as YAML/JSON text
    fn parse_template(payload: &Payload) -> Result<serde_json::Value, String> {
        let value = match payload {
            Payload::Document(value) => value.clone(),
            Payload::Bytes(bytes) => serde_yaml::from_slice::<serde_json::Value>(bytes)
                .map_err(|e| format!("template is not valid YAML or JSON: {}", e))?,
        };

        if !value.is_object() {
            return Err("template must be a mapping".to_string());
        }
        Ok(value)
    }
}
