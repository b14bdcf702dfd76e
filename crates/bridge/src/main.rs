//! TermBridge service binary.
//!
//! Serves shell sessions to WebSocket terminal clients.

use std::path::PathBuf;

use bridge::config::Config;
use bridge::server::Server;
use clap::{Parser, Subcommand};

/// TermBridge - WebSocket-to-PTY session bridge for browser terminals.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Start the bridge server
    Serve {
        /// Override the listener bind address
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Validate the effective configuration and exit
    Check,
}

/// Filter for the tracing subscriber: `--verbose` wins, then
/// `TERMBRIDGE_LOG_LEVEL`, then the info default. The subscriber comes up
/// before configuration loading so load and override messages are not
/// dropped, which means the config file cannot steer the filter it is
/// loaded under.
fn log_filter(verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        std::env::var("TERMBRIDGE_LOG_LEVEL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.network.bind_addr = bind;
            }
            config.validate()?;

            tracing::info!("TermBridge starting");
            let server = Server::bind(config).await?;

            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                }
            }

            Ok(())
        }
        Commands::Check => {
            config.validate()?;
            println!("configuration ok");
            Ok(())
        }
    }
}
