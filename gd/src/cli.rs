//! CLI definition

use clap::Parser;
use std::path::PathBuf;

/// gitdeploy - release a repository on every push
#[derive(Debug, Parser)]
#[command(
    name = "gitdeploy",
    about = "Listen for push webhooks and release the pushed branch into timestamped directories",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Listen on a particular port [default: 7777]
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Listen for a particular branch [default: master]
    #[arg(short = 'b', long)]
    pub branch: Option<String>,

    /// Execute a command post deploy, e.g. -e "systemctl reload app"
    #[arg(short = 'e', long = "exec", value_name = "COMMAND", allow_hyphen_values = true)]
    pub command: Option<String>,

    /// Verbose logging to stdout
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level when verbose (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Address to bind the webhook listener [default: 0.0.0.0]
    #[arg(long)]
    pub bind: Option<String>,

    /// Repository to deploy, as organization/repository
    #[arg(value_name = "ORG/REPO")]
    pub repository: String,

    /// Directory holding working/, releases/, archives/ and the current link
    #[arg(value_name = "RELEASES_DIR")]
    pub releases: PathBuf,
}
