// CLI module - load a configuration file and drive the supervisor

mod output;

use crate::config::VigilConfig;
use crate::logs::FileLogSink;
use crate::process::{OsSpawner, SysinfoProbe};
use crate::supervisor::Supervisor;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub use output::print_error;

/// vigil - supervise long-running processes from a configuration file
#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured process and supervise until SIGINT/SIGTERM
    Run {
        /// Path to the configuration file (.toml or .json)
        config: PathBuf,

        /// Do not print operational events to stdout
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate a configuration file without starting anything
    Check {
        /// Path to the configuration file (.toml or .json)
        config: PathBuf,
    },
}

impl Cli {
    /// Parse arguments and run the selected command
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute().await
    }

    async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { config, quiet } => run_supervisor(&config, quiet).await,
            Commands::Check { config } => check_config(&config),
        }
    }
}

fn load_config(path: &Path) -> Result<VigilConfig> {
    VigilConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    output::print_spec_table(&config.specs());
    output::print_success_msg(&format!(
        "{} is valid ({} process spec(s))",
        path.display(),
        config.processes.len()
    ));
    Ok(())
}

async fn run_supervisor(path: &Path, quiet: bool) -> Result<()> {
    let config = load_config(path)?;
    let specs = config.specs();

    let sink = FileLogSink::new(&config.supervisor, &specs)
        .await
        .context("Failed to prepare log files")?;
    let spawner = OsSpawner::with_log_sink(Arc::new(sink));

    let (supervisor, mut join) =
        Supervisor::from_config(&config, Arc::new(spawner), Box::new(SysinfoProbe::new()))?;

    let printer = if quiet {
        None
    } else {
        let mut events = supervisor.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => output::print_event(&event),
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} supervisor events", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    };

    supervisor.start_all().await?;
    output::print_status_table(&supervisor.status());
    info!("Supervising {} process(es)", supervisor.status().processes.len());

    tokio::select! {
        signal = shutdown_signal() => {
            signal.context("Failed to listen for shutdown signals")?;
            info!("Shutdown signal received, stopping all processes");
            supervisor.stop_all().await?;
            output::print_status_table(&supervisor.status());
        }
        finished = &mut join => {
            // The actor only ends on its own after an internal failure
            finished.context("Supervisor task panicked")??;
            anyhow::bail!("Supervisor stopped unexpectedly");
        }
    }

    drop(supervisor);
    join.await.context("Supervisor task panicked")??;

    if let Some(printer) = printer {
        printer.abort();
    }
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or, on unix, SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["vigil", "run", "ecosystem.toml", "--quiet"]).unwrap();
        match cli.command {
            Commands::Run { config, quiet } => {
                assert_eq!(config, PathBuf::from("ecosystem.toml"));
                assert!(quiet);
            }
            _ => panic!("Expected run"),
        }
    }

    #[test]
    fn test_check_reports_invalid_config() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(
            &path,
            r#"
[processes.bot]
executable = "python3"
instances = 0
"#,
        )
        .unwrap();

        let err = check_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("instances"));
    }
}
