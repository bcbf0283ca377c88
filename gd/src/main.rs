//! gitdeploy - push-triggered release daemon
//!
//! Prepares the releases directory, then serves the webhook until interrupted.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use gitdeploy::cli::Cli;
use gitdeploy::config::{Config, FileConfig};
use gitdeploy::git::{GitCli, Vcs};
use gitdeploy::prepare::prepare;
use gitdeploy::release::ReleaseManager;
use gitdeploy::webhook;
use gitdeploy::worker::DeployWorker;

/// Install a stdout subscriber when verbose; otherwise logging stays a no-op
fn setup_logging(verbose: bool, cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    if !verbose {
        return Ok(());
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install logger: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = FileConfig::load_log_level(cli.config.as_ref());
    setup_logging(cli.verbose, cli.log_level.as_deref(), config_log_level.as_deref())
        .context("Failed to setup logging")?;

    let file = FileConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let config = Config::resolve(&cli, file)?;

    info!(
        repo = %config.target.repository(),
        releases = %config.target.releases_root.display(),
        branch = %config.target.branch,
        port = config.port,
        command = %config.post_deploy.as_ref().map(|c| c.display()).unwrap_or_default(),
        "gitdeploy starting"
    );

    let vcs: Arc<dyn Vcs> = Arc::new(GitCli::new());
    prepare(&config.target, vcs.as_ref(), &config.clone_url)
        .await
        .context("Failed to prepare releases directory")?;

    let manager = ReleaseManager::new(config.target.clone(), vcs);
    let (handle, worker) = DeployWorker::spawn(manager, config.post_deploy.clone());

    let listener = webhook::bind(&config.listen_addr()).await?;

    tokio::select! {
        result = webhook::serve(listener, handle.clone()) => {
            debug!("main: listener exited");
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, finishing queued work before exit");
        }
    }

    // Pending notifications ahead of the shutdown command still run
    handle.shutdown().ok();
    worker.await.context("Deploy worker panicked")?;
    info!("gitdeploy stopped");
    Ok(())
}
