//! Release manager
//!
//! A release is four directory-state transitions:
//!
//! 1. `git pull` the working checkout
//! 2. name the release `<YYYY-MM-DD>.<hhmmss>.<commit>`
//! 3. copy `working/` into `releases/<name>/`
//! 4. repoint `current` at the new release
//!
//! A failure in steps 1-3 leaves `current` exactly as it was. Step 4 swaps the
//! link by renaming a freshly created symlink over `current`, so readers see
//! either the old release or the new one, never a missing link.
//!
//! `ReleaseManager` is not internally synchronized. Callers must serialize
//! releases; the deploy worker does so by owning the only manager.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Local};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DeployTarget, RELEASES_DIR};
use crate::copy::{CopyError, copy_tree};
use crate::git::{GitError, Vcs};

static COMMIT_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9A-Za-z._-]+$").expect("valid regex"));

/// Errors from a release attempt
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("Failed to update working copy: {0}")]
    UpdateFailed(#[source] GitError),

    #[error("Refusing to release invalid commit id '{0}'")]
    InvalidCommit(String),

    #[error("Failed to snapshot working copy: {0}")]
    Copy(#[from] CopyError),

    #[error("Failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Release task failed: {0}")]
    Task(String),
}

impl ReleaseError {
    /// Same-second re-release of the same commit
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Copy(CopyError::AlreadyExists(_)))
    }
}

/// A completed release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePath {
    /// Directory name under `releases/`
    pub name: String,
    /// Absolute (or root-relative, as configured) path of the snapshot
    pub path: PathBuf,
    /// Commit the snapshot was taken at
    pub commit: String,
    /// Entries that could not be copied into the snapshot
    pub copy_failures: usize,
}

/// Release directory name for `commit` taken at `at`
///
/// Fixed-width and zero-padded, so lexical order is chronological order.
pub fn release_name(at: &DateTime<Local>, commit: &str) -> String {
    format!("{}.{}", at.format("%Y-%m-%d.%H%M%S"), commit)
}

/// Reject ids that could escape `releases/` or are not ids at all
pub fn validate_commit(commit: &str) -> Result<(), ReleaseError> {
    if commit == "." || commit == ".." || !COMMIT_ID.is_match(commit) {
        return Err(ReleaseError::InvalidCommit(commit.to_string()));
    }
    Ok(())
}

/// Drives releases for one deploy target
pub struct ReleaseManager {
    target: DeployTarget,
    vcs: Arc<dyn Vcs>,
}

impl ReleaseManager {
    pub fn new(target: DeployTarget, vcs: Arc<dyn Vcs>) -> Self {
        debug!(?target, "ReleaseManager::new: called");
        Self { target, vcs }
    }

    pub fn target(&self) -> &DeployTarget {
        &self.target
    }

    /// Release `commit`, stamped with the local time once the pull finishes
    pub async fn release(&self, commit: &str) -> Result<ReleasePath, ReleaseError> {
        self.release_with_clock(commit, Local::now).await
    }

    /// Release `commit`, naming the snapshot after `at`
    pub async fn release_at(&self, commit: &str, at: DateTime<Local>) -> Result<ReleasePath, ReleaseError> {
        self.release_with_clock(commit, move || at).await
    }

    /// Release `commit`; `clock` is read after the working copy is updated
    pub async fn release_with_clock<F>(&self, commit: &str, clock: F) -> Result<ReleasePath, ReleaseError>
    where
        F: FnOnce() -> DateTime<Local>,
    {
        debug!(%commit, "ReleaseManager::release_with_clock: called");
        validate_commit(commit)?;

        let working = self.target.working_dir();
        let out = self.vcs.pull(&working, &self.target.branch).await.map_err(|e| {
            error!(error = %e, "Failed to update working copy");
            ReleaseError::UpdateFailed(e)
        })?;
        let out = out.trim();
        if !out.is_empty() {
            info!("{}", out);
        }

        let at = clock();
        let name = release_name(&at, commit);
        let path = self.target.releases_dir().join(&name);
        info!(release = %name, "Release to: {}", path.display());

        let report = {
            let (from, to) = (working.clone(), path.clone());
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| ReleaseError::Task(e.to_string()))??
        };
        if !report.is_complete() {
            warn!(
                release = %name,
                failures = report.failures.len(),
                "Release snapshot is missing entries"
            );
        }

        let link = self.target.current_link();
        let link_target = Path::new(RELEASES_DIR).join(&name);
        tokio::task::spawn_blocking(move || swap_symlink(&link_target, &link))
            .await
            .map_err(|e| ReleaseError::Task(e.to_string()))??;

        info!(release = %name, files = report.files, "Release is live");
        Ok(ReleasePath {
            name,
            path,
            commit: commit.to_string(),
            copy_failures: report.failures.len(),
        })
    }

    /// Name of the release `current` points at, if any
    pub fn current_release(&self) -> Option<String> {
        let link = std::fs::read_link(self.target.current_link()).ok()?;
        link.file_name().map(|n| n.to_string_lossy().to_string())
    }

    /// Release directory names, oldest first
    pub fn list_releases(&self) -> Result<Vec<String>, ReleaseError> {
        let dir = self.target.releases_dir();
        let entries = std::fs::read_dir(&dir).map_err(|source| ReleaseError::Io {
            op: "read directory",
            path: dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Point `link` at `target` by renaming a new symlink over it
fn swap_symlink(target: &Path, link: &Path) -> Result<(), ReleaseError> {
    debug!(?target, ?link, "swap_symlink: called");
    let staging = link.with_file_name(format!(".current-{}", Uuid::now_v7()));

    std::os::unix::fs::symlink(target, &staging).map_err(|source| ReleaseError::Io {
        op: "create symlink",
        path: staging.clone(),
        source,
    })?;

    if let Err(source) = std::fs::rename(&staging, link) {
        let _ = std::fs::remove_file(&staging);
        return Err(ReleaseError::Io {
            op: "replace",
            path: link.to_path_buf(),
            source,
        });
    }
    Ok(())
}
