//! gitdeploy configuration types and loading
//!
//! Settings come from an optional YAML file and are overridden by command-line
//! flags. The result is a [`Config`] built once at startup and handed to every
//! component by reference; nothing reads configuration from global state.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cli::Cli;
use crate::hook::PostDeployCommand;

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_BRANCH: &str = "master";
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_CLONE_URL: &str = "git@github.com:{org}/{repo}.git";

pub const WORKING_DIR: &str = "working";
pub const RELEASES_DIR: &str = "releases";
pub const ARCHIVES_DIR: &str = "archives";
pub const CURRENT_LINK: &str = "current";

/// Errors from interpreting configuration values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Repository must be of the form organization/repository, got '{0}'")]
    InvalidRepository(String),

    #[error("Branch name must not be empty")]
    EmptyBranch,
}

/// On-disk configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Port the webhook listener binds
    pub port: u16,

    /// Address the webhook listener binds
    pub bind: String,

    /// Branch to deploy
    pub branch: String,

    /// Post-deploy command line, split on whitespace
    pub command: Option<String>,

    /// Log level used when verbose output is on
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Clone URL template with `{org}` and `{repo}` placeholders
    #[serde(rename = "clone-url")]
    pub clone_url: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            command: None,
            log_level: None,
            clone_url: DEFAULT_CLONE_URL.to_string(),
        }
    }
}

impl FileConfig {
    /// Load configuration with fallback chain
    ///
    /// An explicit path must load. Otherwise `./.gitdeploy.yml`, then
    /// `<config dir>/gitdeploy/gitdeploy.yml`, then built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".gitdeploy.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("gitdeploy").join("gitdeploy.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Peek at the log level before logging is initialized
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::debug!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// The repository, branch and directory a daemon deploys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub org: String,
    pub repo_name: String,
    pub branch: String,
    pub releases_root: PathBuf,
}

impl DeployTarget {
    /// Build a target from an `org/repo` identifier
    pub fn new(repository: &str, branch: &str, releases_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        debug!(%repository, %branch, "DeployTarget::new: called");
        let (org, repo_name) = parse_repository(repository)?;
        if branch.trim().is_empty() {
            return Err(ConfigError::EmptyBranch);
        }
        Ok(Self {
            org,
            repo_name,
            branch: branch.to_string(),
            releases_root: releases_root.into(),
        })
    }

    /// `org/repo`
    pub fn repository(&self) -> String {
        format!("{}/{}", self.org, self.repo_name)
    }

    /// The ref a push to the deploy branch carries
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.releases_root.join(WORKING_DIR)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.releases_root.join(RELEASES_DIR)
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.releases_root.join(ARCHIVES_DIR)
    }

    pub fn current_link(&self) -> PathBuf {
        self.releases_root.join(CURRENT_LINK)
    }

    /// Expand a clone URL template for this repository
    pub fn clone_url(&self, template: &str) -> String {
        template.replace("{org}", &self.org).replace("{repo}", &self.repo_name)
    }
}

/// Split `org/repo`; exactly one slash with non-empty halves
pub fn parse_repository(repository: &str) -> Result<(String, String), ConfigError> {
    match repository.split_once('/') {
        Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((org.to_string(), name.to_string()))
        }
        _ => Err(ConfigError::InvalidRepository(repository.to_string())),
    }
}

/// Resolved daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub target: DeployTarget,
    pub bind: String,
    pub port: u16,
    pub post_deploy: Option<PostDeployCommand>,
    pub clone_url: String,
}

impl Config {
    /// Merge parsed flags over a loaded file; flags win
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        debug!("Config::resolve: called");
        let branch = cli.branch.clone().unwrap_or(file.branch);
        let target = DeployTarget::new(&cli.repository, &branch, &cli.releases).context("Invalid deploy target")?;
        let command = cli.command.clone().or(file.command);

        Ok(Self {
            target,
            bind: cli.bind.clone().unwrap_or(file.bind),
            port: cli.port.unwrap_or(file.port),
            post_deploy: command.as_deref().and_then(PostDeployCommand::parse),
            clone_url: file.clone_url,
        })
    }

    /// `bind:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
