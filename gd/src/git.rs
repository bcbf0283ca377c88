//! Git operations behind a trait
//!
//! The release pipeline only needs three verbs from version control: clone the
//! repository once, check out the deploy branch, and pull it on every release.
//! [`GitCli`] shells out to the `git` binary; tests substitute their own [`Vcs`].

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Error types for git operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GitError {
    #[error("Failed to spawn git: {0}")]
    Spawn(String),

    #[error("git {command} exited with {code}: {stderr}")]
    Failed { command: String, code: i32, stderr: String },
}

/// Version-control operations used by the deploy pipeline
///
/// Each method returns the command's stdout on success so callers can log it.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone `url` into `dest`, run from `parent`
    async fn clone_repo(&self, url: &str, parent: &Path, dest: &str) -> Result<String, GitError>;

    /// Check out `branch` inside `checkout`
    async fn checkout(&self, checkout: &Path, branch: &str) -> Result<String, GitError>;

    /// Pull `branch` from `origin` inside `checkout`
    async fn pull(&self, checkout: &Path, branch: &str) -> Result<String, GitError>;
}

/// [`Vcs`] backed by the `git` command-line tool
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!(?dir, ?args, "GitCli::run: called");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| GitError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(status = ?output.status, %stderr, "GitCli::run: command failed");
            return Err(GitError::Failed {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_repo(&self, url: &str, parent: &Path, dest: &str) -> Result<String, GitError> {
        self.run(parent, &["clone", url, dest]).await
    }

    async fn checkout(&self, checkout: &Path, branch: &str) -> Result<String, GitError> {
        self.run(checkout, &["checkout", branch]).await
    }

    async fn pull(&self, checkout: &Path, branch: &str) -> Result<String, GitError> {
        self.run(checkout, &["pull", "origin", branch]).await
    }
}

/// Scriptable in-memory [`Vcs`] for tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        files: Vec<(String, String)>,
        fail_clone: bool,
        fail_checkout: bool,
        fail_pull: bool,
        calls: Vec<String>,
    }

    /// Clone creates the destination and writes the configured files; pull
    /// rewrites them. Any verb can be told to fail.
    #[derive(Default)]
    pub struct FakeVcs {
        state: Mutex<State>,
    }

    impl FakeVcs {
        pub fn with_files(files: &[(&str, &str)]) -> Self {
            let fake = Self::default();
            fake.set_files(files);
            fake
        }

        pub fn set_files(&self, files: &[(&str, &str)]) {
            self.state.lock().unwrap().files = files.iter().map(|(n, c)| (n.to_string(), c.to_string())).collect();
        }

        pub fn fail_clone(&self, fail: bool) {
            self.state.lock().unwrap().fail_clone = fail;
        }

        pub fn fail_checkout(&self, fail: bool) {
            self.state.lock().unwrap().fail_checkout = fail;
        }

        pub fn fail_pull(&self, fail: bool) {
            self.state.lock().unwrap().fail_pull = fail;
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn failure(command: &str) -> GitError {
            GitError::Failed {
                command: command.to_string(),
                code: 1,
                stderr: "fatal: scripted failure".to_string(),
            }
        }

        fn write_files(&self, dir: &Path) -> Result<(), GitError> {
            let files = self.state.lock().unwrap().files.clone();
            for (name, contents) in files {
                let path = dir.join(name);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| GitError::Spawn(e.to_string()))?;
                }
                std::fs::write(path, contents).map_err(|e| GitError::Spawn(e.to_string()))?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Vcs for FakeVcs {
        async fn clone_repo(&self, url: &str, parent: &Path, dest: &str) -> Result<String, GitError> {
            let fail = {
                let mut state = self.state.lock().unwrap();
                state.calls.push(format!("clone {} {}", url, dest));
                state.fail_clone
            };
            if fail {
                return Err(Self::failure("clone"));
            }
            let dir = parent.join(dest);
            std::fs::create_dir(&dir).map_err(|e| GitError::Spawn(e.to_string()))?;
            self.write_files(&dir)?;
            Ok(String::new())
        }

        async fn checkout(&self, _checkout: &Path, branch: &str) -> Result<String, GitError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("checkout {}", branch));
            if state.fail_checkout {
                return Err(Self::failure("checkout"));
            }
            Ok(String::new())
        }

        async fn pull(&self, checkout: &Path, branch: &str) -> Result<String, GitError> {
            let fail = {
                let mut state = self.state.lock().unwrap();
                state.calls.push(format!("pull origin {}", branch));
                state.fail_pull
            };
            if fail {
                return Err(Self::failure("pull origin"));
            }
            self.write_files(checkout)?;
            Ok("Already up to date.".to_string())
        }
    }
}
