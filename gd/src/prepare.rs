//! Environment preparation
//!
//! Runs once at startup, before the webhook listener is bound. Every step is
//! idempotent so the daemon can be restarted against an existing layout.

use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DeployTarget, WORKING_DIR};
use crate::git::{GitError, Vcs};

const DIR_MODE: u32 = 0o755;
const PROBE_FILE: &str = ".gitdeploy-write-test";

/// Errors from preparing the releases directory
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Releases directory {} is not writable: {source}", path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to clone {url}: {source}")]
    CloneFailed {
        url: String,
        #[source]
        source: GitError,
    },

    #[error("Failed to check out {branch} into working copy: {source}")]
    CheckoutFailed {
        branch: String,
        #[source]
        source: GitError,
    },

    #[error("Failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What a prepare run changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PrepareReport {
    /// Directories created by this run
    pub created: Vec<PathBuf>,
    /// Whether the working copy was cloned by this run
    pub cloned: bool,
}

impl PrepareReport {
    /// True when the layout was already complete
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && !self.cloned
    }
}

/// Ensure `releases_root`, `releases/`, `archives/` and the working checkout exist
///
/// An existing `working/` directory is trusted as-is; it is not re-cloned or
/// checked against the configured repository.
pub async fn prepare(target: &DeployTarget, vcs: &dyn Vcs, clone_url: &str) -> Result<PrepareReport, SetupError> {
    debug!(root = ?target.releases_root, "prepare: called");
    let mut report = PrepareReport::default();

    if ensure_dir(&target.releases_root, true)? {
        report.created.push(target.releases_root.clone());
    }
    check_writable(&target.releases_root)?;

    for dir in [target.releases_dir(), target.archives_dir()] {
        if ensure_dir(&dir, false)? {
            report.created.push(dir);
        }
    }

    let working = target.working_dir();
    match fs::metadata(&working) {
        Ok(meta) if meta.is_dir() => {
            debug!(?working, "prepare: working copy present, trusting it");
        }
        Ok(_) => {
            return Err(SetupError::Io {
                op: "use working copy",
                path: working,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
            });
        }
        Err(_) => {
            let url = target.clone_url(clone_url);
            info!(%url, "Cloning repository into working copy");
            let out = vcs
                .clone_repo(&url, &target.releases_root, WORKING_DIR)
                .await
                .map_err(|source| SetupError::CloneFailed {
                    url: url.clone(),
                    source,
                })?;
            log_output(&out);

            let out = vcs
                .checkout(&working, &target.branch)
                .await
                .map_err(|source| SetupError::CheckoutFailed {
                    branch: target.branch.clone(),
                    source,
                })?;
            log_output(&out);
            report.cloned = true;
        }
    }

    info!(created = report.created.len(), cloned = report.cloned, "Releases directory prepared");
    Ok(report)
}

/// Create `dir` with mode 0755 unless it is already a directory; true if created
fn ensure_dir(dir: &Path, recursive: bool) -> Result<bool, SetupError> {
    if fs::metadata(dir).map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(false);
    }
    debug!(?dir, "ensure_dir: creating");
    DirBuilder::new()
        .recursive(recursive)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|source| SetupError::Io {
            op: "create directory",
            path: dir.to_path_buf(),
            source,
        })?;
    Ok(true)
}

fn check_writable(root: &Path) -> Result<(), SetupError> {
    let probe = root.join(PROBE_FILE);
    File::create(&probe).map_err(|source| SetupError::NotWritable {
        path: root.to_path_buf(),
        source,
    })?;
    if let Err(e) = fs::remove_file(&probe) {
        warn!(?probe, error = %e, "Failed to remove write probe");
    }
    Ok(())
}

fn log_output(out: &str) {
    let out = out.trim();
    if !out.is_empty() {
        info!("{}", out);
    }
}
