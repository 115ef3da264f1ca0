//! Shell build executor - runs each command through `sh -c`

use crate::backend::{BackendError, BuildExecutor, ExitStatus, Workspace};
use crate::core::{is_valid_artifact_name, ActionId, Artifact, Capability, Payload};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory inside a workspace holding the staged inputs
pub const INPUT_DIR: &str = "inputs";

/// Directory inside a workspace the commands write outputs to
pub const OUTPUT_DIR: &str = "outputs";

/// Executes commands as local shell processes
///
/// Every action gets a fresh directory under `base_dir`:
///
/// ```text
/// <base_dir>/<workspace id>/inputs/<artifact>
/// <base_dir>/<workspace id>/outputs/<artifact>
/// ```
///
/// Commands run with the workspace as working directory and see
/// `PIPELINE_INPUT_DIR`, `PIPELINE_OUTPUT_DIR` and `PIPELINE_ACTION` in
/// addition to the action's bindings.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    base_dir: PathBuf,
    shell: String,
    keep_workspaces: bool,
}

impl ShellExecutor {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            shell: "sh".to_string(),
            keep_workspaces: false,
        }
    }

    /// Use a different POSIX shell
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Leave workspaces on disk after the action finishes
    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// File an artifact is staged as, named exactly like the artifact
    fn file_name(artifact: &str) -> Result<&str, BackendError> {
        if is_valid_artifact_name(artifact) {
            Ok(artifact)
        } else {
            Err(BackendError::InvalidName(format!(
                "artifact '{}' cannot be used as a file name",
                artifact
            )))
        }
    }

    async fn stage_inputs(root: &Path, inputs: &[Arc<Artifact>]) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(root.join(INPUT_DIR)).await?;
        tokio::fs::create_dir_all(root.join(OUTPUT_DIR)).await?;

        for artifact in inputs {
            let bytes = match &artifact.payload {
                Payload::Bytes(bytes) => bytes.clone(),
                Payload::Document(value) => serde_json::to_vec_pretty(value)
                    .map_err(|e| BackendError::Internal(e.to_string()))?,
            };
            let path = root.join(INPUT_DIR).join(Self::file_name(artifact.name())?);
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BuildExecutor for ShellExecutor {
    async fn prepare(
        &self,
        action: &ActionId,
        inputs: &[Arc<Artifact>],
        capability: &Capability,
    ) -> Result<Workspace, BackendError> {
        for artifact in inputs {
            Self::file_name(artifact.name())?;
        }

        let id = Uuid::new_v4();
        let root = self.base_dir.join(id.to_string());
        if let Err(e) = Self::stage_inputs(&root, inputs).await {
            // never handed out, so release it here
            if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
                warn!("Failed to remove workspace {}: {}", root.display(), cleanup);
            }
            return Err(e);
        }

        debug!(
            "Prepared workspace {} for {} as {} ({} inputs)",
            id,
            action,
            capability.principal,
            inputs.len()
        );

        Ok(Workspace {
            id,
            action: action.clone(),
            root,
        })
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ExitStatus, BackendError> {
        debug!("Running `{}` for {}", command, workspace.action);

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&workspace.root)
            .envs(env)
            .env("PIPELINE_INPUT_DIR", workspace.root.join(INPUT_DIR))
            .env("PIPELINE_OUTPUT_DIR", workspace.root.join(OUTPUT_DIR))
            .env("PIPELINE_ACTION", workspace.action.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackendError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!("[{}] {}", workspace.action, line);
        }

        let status = ExitStatus::from(output.status);
        if !status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "`{}` exited with code {}: {}",
                command,
                status.code(),
                stderr.trim()
            );
        }

        Ok(status)
    }

    async fn collect(
        &self,
        workspace: &Workspace,
        outputs: &[String],
    ) -> Result<HashMap<String, Payload>, BackendError> {
        let mut collected = HashMap::new();
        for name in outputs {
            let path = workspace.root.join(OUTPUT_DIR).join(Self::file_name(name)?);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    collected.insert(name.clone(), Payload::Bytes(bytes));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(collected)
    }

    async fn release(&self, workspace: Workspace) -> Result<(), BackendError> {
        if self.keep_workspaces {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&workspace.root).await?;
        Ok(())
    }
}
