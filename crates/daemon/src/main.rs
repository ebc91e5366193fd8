//! WFM Daemon
//!
//! Sandboxed web file manager.

use std::io::BufRead;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use wfm::auth::hash_password;
use wfm::bootstrap::{Bootstrap, BootstrapPlan, LetsEncrypt, Transport, UnixSystem};
use wfm::config::Config;
use wfm::logging::init_logging;
use wfm::server::{self, AppState};

/// WFM - sandboxed web file manager.
#[derive(Parser, Debug)]
#[command(name = "wfm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving
    Start,

    /// Print the SHA-256 digest of a password read from stdin
    HashPassword,

    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli)?;
            // Opened before the root change so the file stays reachable.
            let _log_guard = init_logging(
                &config.server.log_level,
                cli.verbose,
                config.server.log_file.as_deref(),
            )?;
            tracing::info!("WFM daemon starting...");
            run(config).await?;
        }
        Commands::HashPassword => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            println!("{}", hash_password(line.trim_end_matches(['\r', '\n'])));
        }
        Commands::CheckConfig => {
            let config = load_config(&cli)?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let plan = BootstrapPlan::from_config(&config);

    let mut bootstrap = Bootstrap::new(UnixSystem);
    let outcome = match bootstrap.run(&plan, &LetsEncrypt) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(stage = %bootstrap.tracker().current(), error = %e, "startup failed");
            return Err(e.into());
        }
    };

    let scheme = match outcome.transport() {
        Transport::Http => "http",
        Transport::Https => "https",
    };
    tracing::info!(
        scheme,
        prefix = %config.server.prefix,
        deny = ?config.effective_deny_prefixes(),
        "Serving"
    );

    server::serve(outcome, state, wait_for_shutdown_signal()).await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            tracing::warn!("Failed to register signal handlers; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["wfm", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["wfm", "start", "-v", "--config", "/etc/wfm.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/wfm.toml")));
    }

    #[test]
    fn test_hash_password_command() {
        let cli = Cli::try_parse_from(["wfm", "hash-password"]).unwrap();
        assert!(matches!(cli.command, Commands::HashPassword));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["wfm", "frobnicate"]).is_err());
    }
}
