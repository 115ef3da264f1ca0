//! Bounded retry around a unit registry

use crate::backend::{BackendError, DeployedUnit, UnitRegistry, UnitStatus, UpsertOutcome};
use crate::core::config::DeploySettings;
use crate::core::Capability;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// How often, and how patiently, to retry a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further one
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Delay before attempt `attempt` (1-based, so attempt 2 is the first retry)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        self.backoff.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(1000))
    }
}

impl From<&DeploySettings> for RetryPolicy {
    fn from(settings: &DeploySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.backoff_ms),
        )
    }
}

/// Retries transient upsert failures of the wrapped registry
///
/// Permanent failures (denied scopes, invalid templates) are returned on the
/// first attempt. Reads are passed through untouched.
#[derive(Debug)]
pub struct RetryingRegistry<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: UnitRegistry> RetryingRegistry<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<R: UnitRegistry> UnitRegistry for RetryingRegistry<R> {
    async fn upsert(
        &self,
        name: &str,
        template: &serde_json::Value,
        capability: &Capability,
    ) -> Result<UpsertOutcome, BackendError> {
        let mut attempt = 1;
        loop {
            match self.inner.upsert(name, template, capability).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    attempt += 1;
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "Upsert of {} failed ({}), attempt {}/{} in {:?}",
                        name, e, attempt, self.policy.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, BackendError> {
        self.inner.status(name).await
    }

    async fn get(&self, name: &str) -> Result<Option<DeployedUnit>, BackendError> {
        self.inner.get(name).await
    }
}
