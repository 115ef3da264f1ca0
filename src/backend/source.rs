//! Source providers

use crate::backend::{BackendError, SourceProvider, SourceSnapshot};
use crate::core::Capability;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Serves a fixed snapshot
#[derive(Debug, Clone)]
pub struct StaticSource {
    snapshot: SourceSnapshot,
}

impl StaticSource {
    pub fn new(revision: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            snapshot: SourceSnapshot {
                revision: revision.into(),
                content: content.into(),
            },
        }
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    async fn fetch(&self, _capability: &Capability) -> Result<SourceSnapshot, BackendError> {
        Ok(self.snapshot.clone())
    }
}

/// Snapshots the `HEAD` of a local git checkout
///
/// The revision is `git rev-parse HEAD`; the content is the tar stream of
/// `git archive HEAD`.
#[derive(Debug, Clone)]
pub struct GitSource {
    repo: PathBuf,
    git: String,
}

impl GitSource {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            git: "git".to_string(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Vec<u8>, BackendError> {
        let command = format!("{} {}", self.git, args.join(" "));
        let output = Command::new(&self.git)
            .args(args)
            .current_dir(&self.repo)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackendError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(BackendError::Spawn {
                command,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn fetch(&self, capability: &Capability) -> Result<SourceSnapshot, BackendError> {
        debug!(
            "Snapshotting {} for {}",
            self.repo.display(),
            capability.principal
        );

        let revision = String::from_utf8(self.git(&["rev-parse", "HEAD"]).await?)
            .map_err(|e| BackendError::Internal(format!("non UTF-8 revision: {}", e)))?
            .trim()
            .to_string();
        let content = self.git(&["archive", "--format=tar", "HEAD"]).await?;

        Ok(SourceSnapshot { revision, content })
    }
}
