//! Recursive directory copy
//!
//! Release snapshots are produced by copying the working checkout into a fresh
//! directory under `releases/`. The copy is best-effort per entry: a file that
//! cannot be copied is logged and recorded in the [`CopyReport`] while the rest
//! of the tree is still copied. Only failures on the top-level directory itself
//! (missing source, existing destination, mkdir failure) abort the copy.

use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors from copy operations
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Source is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CopyError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A single entry that could not be copied
#[derive(Debug)]
pub struct CopyFailure {
    /// Source path of the entry
    pub path: PathBuf,
    /// Why it failed
    pub error: CopyError,
}

/// Outcome of a tree copy that got past its top-level checks
#[derive(Debug, Default)]
pub struct CopyReport {
    /// Regular files copied (symlink targets included)
    pub files: usize,
    /// Directories created, the root included
    pub directories: usize,
    /// Entries skipped because they failed, in the order encountered
    pub failures: Vec<CopyFailure>,
}

impl CopyReport {
    /// True when every entry was copied
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: CopyReport) {
        self.files += other.files;
        self.directories += other.directories;
        self.failures.extend(other.failures);
    }
}

/// Copy a single file's bytes, then try to give the destination the source's mode.
///
/// Symlinks are followed: the destination is a regular file holding the target's
/// content. Anything that cannot be opened and read as a byte stream fails.
pub fn copy_file(source: &Path, dest: &Path) -> Result<(), CopyError> {
    debug!(?source, ?dest, "copy_file: called");
    let mut reader = File::open(source).map_err(|e| CopyError::io("open", source, e))?;
    let mut writer = File::create(dest).map_err(|e| CopyError::io("create", dest, e))?;
    io::copy(&mut reader, &mut writer).map_err(|e| CopyError::io("copy", source, e))?;

    let metadata = fs::metadata(source).map_err(|e| CopyError::io("stat", source, e))?;
    fs::set_permissions(dest, metadata.permissions()).map_err(|e| CopyError::io("chmod", dest, e))?;
    Ok(())
}

/// Recursively copy `source` into `dest`, which must not exist yet.
///
/// Entries are visited in the order the filesystem returns them. Directories are
/// recursed into; every other entry type goes through [`copy_file`].
pub fn copy_tree(source: &Path, dest: &Path) -> Result<CopyReport, CopyError> {
    debug!(?source, ?dest, "copy_tree: called");
    let metadata = fs::metadata(source).map_err(|e| CopyError::io("stat", source, e))?;
    if !metadata.is_dir() {
        return Err(CopyError::NotADirectory(source.to_path_buf()));
    }

    match fs::symlink_metadata(dest) {
        Ok(_) => return Err(CopyError::AlreadyExists(dest.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CopyError::io("stat", dest, e)),
    }

    let mode = metadata.permissions().mode();
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dest)
        .map_err(|e| CopyError::io("create directory", dest, e))?;
    // umask may have masked bits off
    fs::set_permissions(dest, fs::Permissions::from_mode(mode)).map_err(|e| CopyError::io("chmod", dest, e))?;

    let mut report = CopyReport {
        directories: 1,
        ..Default::default()
    };

    let entries = fs::read_dir(source).map_err(|e| CopyError::io("read directory", source, e))?;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(?source, error = %e, "Failed to read directory entry");
                report.failures.push(CopyFailure {
                    path: source.to_path_buf(),
                    error: CopyError::io("read directory", source, e),
                });
                continue;
            }
        };

        let from = entry.path();
        let to = dest.join(entry.file_name());
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir {
            match copy_tree(&from, &to) {
                Ok(nested) => report.absorb(nested),
                Err(error) => {
                    warn!(path = ?from, %error, "Failed to copy directory, continuing");
                    report.failures.push(CopyFailure { path: from, error });
                }
            }
        } else {
            match copy_file(&from, &to) {
                Ok(()) => report.files += 1,
                Err(error) => {
                    warn!(path = ?from, %error, "Failed to copy file, continuing");
                    report.failures.push(CopyFailure { path: from, error });
                }
            }
        }
    }

    debug!(
        files = report.files,
        directories = report.directories,
        failures = report.failures.len(),
        "copy_tree: done"
    );
    Ok(report)
}
