//! tunmux CLI
//!
//! Single binary for tunnel operations:
//! - Serve (accept tunnels and echo every stream)
//! - Dial (connect with failover, push traffic or keep the tunnel up)
//! - Configuration management

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunmux::commands::{self, DialOptions};

#[derive(Parser)]
#[command(name = "tunmux")]
#[command(author, version, about = "Multiplexed websocket tunnels")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept tunnels and echo every stream
    Serve {
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,
    },

    /// Dial a tunnel endpoint with failover
    Dial {
        /// Candidate endpoints (override the configured list)
        addresses: Vec<String>,
        /// Multiplexing protocol: smux or yamux
        #[arg(short, long)]
        protocol: Option<String>,
        /// Session rate limit in bytes/second
        #[arg(short, long)]
        limit: Option<f64>,
        /// Use plain ws instead of wss
        #[arg(long)]
        plain: bool,
        /// Number of concurrent echo streams
        #[arg(short, long, default_value_t = 1)]
        streams: usize,
        /// Bytes echoed per stream
        #[arg(short, long, default_value_t = 64 * 1024)]
        bytes: usize,
        /// Keep the tunnel up and redial when it drops
        #[arg(short, long)]
        keep: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Set config value
    Set { key: String, value: String },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            let config = commands::resolve_config(cli.config.as_ref())?;
            commands::serve_command(bind, config, shutdown_token()).await?;
        }

        Commands::Dial {
            addresses,
            protocol,
            limit,
            plain,
            streams,
            bytes,
            keep,
        } => {
            let config = commands::resolve_config(cli.config.as_ref())?;
            let options = DialOptions {
                addresses,
                protocol,
                limit,
                plain,
                streams,
                bytes,
                keep,
            };
            commands::dial_command(config, options, shutdown_token()).await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                commands::config_show(cli.config.as_ref())?;
            }
            ConfigAction::Get { key } => {
                commands::config_get(cli.config.as_ref(), &key)?;
            }
            ConfigAction::Set { key, value } => {
                commands::config_set(cli.config.as_ref(), &key, &value)?;
            }
            ConfigAction::Init { force } => {
                commands::config_init(cli.config.as_ref(), force)?;
            }
            ConfigAction::Path => {
                let path = cli
                    .config
                    .unwrap_or_else(tm_core::config::default_config_path);
                println!("{}", path.display());
            }
        },
    }

    Ok(())
}

/// Token cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    cancel
}
