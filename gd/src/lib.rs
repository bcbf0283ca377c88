//! gitdeploy - push-triggered release daemon
//!
//! gitdeploy keeps a git checkout of one branch and, on every push to that
//! branch, snapshots it into a timestamped release directory and repoints a
//! `current` symlink at the snapshot.
//!
//! # Layout
//!
//! ```text
//! <releases-root>/
//!   working/                          persistent checkout, pulled per release
//!   releases/2024-01-15.093000.<sha>/ immutable snapshots
//!   archives/                         reserved
//!   current -> releases/<latest>
//! ```
//!
//! # Modules
//!
//! - [`copy`] - recursive directory copy with per-entry failure reporting
//! - [`release`] - pull, snapshot, repoint
//! - [`prepare`] - idempotent layout setup at startup
//! - [`git`] - the [`Vcs`] seam and its `git` CLI implementation
//! - [`notification`] - push payloads and the deploy filter
//! - [`worker`] - the single queue consumer that serializes releases
//! - [`webhook`] - HTTP endpoint feeding the worker
//! - [`hook`] - post-deploy command
//! - [`config`] / [`cli`] - startup configuration

pub mod cli;
pub mod config;
pub mod copy;
pub mod git;
pub mod hook;
pub mod notification;
pub mod prepare;
pub mod release;
pub mod webhook;
pub mod worker;

pub use config::{Config, ConfigError, DeployTarget, FileConfig};
pub use copy::{CopyError, CopyFailure, CopyReport, copy_file, copy_tree};
pub use git::{GitCli, GitError, Vcs};
pub use hook::{HookError, PostDeployCommand};
pub use notification::{FilterDecision, PushNotification, evaluate};
pub use prepare::{PrepareReport, SetupError, prepare};
pub use release::{ReleaseError, ReleaseManager, ReleasePath, release_name};
pub use worker::{DeployCommand, DeployEvent, DeployHandle, DeployWorker, WorkerError};
