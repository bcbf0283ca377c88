//! Post-deploy command
//!
//! An optional command run after every successful release, e.g. to reload a
//! service. It runs inside the new release directory and learns about the
//! release through `GITDEPLOY_*` environment variables.

use tokio::process::Command;
use tracing::debug;

use crate::config::DeployTarget;
use crate::release::ReleasePath;

/// Errors from running the post-deploy command
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    #[error("Failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with {code}: {stderr}")]
    Failed { program: String, code: i32, stderr: String },
}

/// A program plus arguments, split from a single command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDeployCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PostDeployCommand {
    /// Split on whitespace; no quoting. Blank input means no command.
    pub fn parse(command: &str) -> Option<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// The command line as it would be typed
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion in the release directory, returning stdout
    pub async fn run(&self, release: &ReleasePath, target: &DeployTarget) -> Result<String, HookError> {
        debug!(command = %self.display(), release = %release.name, "PostDeployCommand::run: called");
        let dir = std::path::absolute(&release.path).map_err(|e| HookError::Spawn {
            program: self.program.clone(),
            message: format!("Failed to resolve {}: {}", release.path.display(), e),
        })?;
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&dir)
            .env("GITDEPLOY_RELEASE", &dir)
            .env("GITDEPLOY_COMMIT", &release.commit)
            .env("GITDEPLOY_BRANCH", &target.branch)
            .env("GITDEPLOY_REPOSITORY", target.repository())
            .output()
            .await
            .map_err(|e| HookError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(HookError::Failed {
                program: self.program.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
