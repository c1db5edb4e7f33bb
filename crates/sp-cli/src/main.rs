//! sshproxy CLI
//!
//! - `run`: start the loopback SSH proxy and drive a command through it
//! - `config`: create, show and validate the settings file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sp_core::{LocalCommunicator, SerializedUi};
use sshproxy::commands;
use sshproxy::output::{print_error, ConsoleUi};

#[derive(Parser)]
#[command(name = "sshproxy")]
#[command(author, version, about = "Loopback SSH proxy for SSH-only provisioning tools")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "SSHPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy and run the configured command against it
    Run {
        /// Loopback port to listen on (overrides config; 0 searches)
        #[arg(short, long)]
        port: Option<u16>,
        /// User the command must log in as (overrides config)
        #[arg(short, long)]
        user: Option<String>,
        /// Emit machine-readable events on stdout
        #[arg(long)]
        machine_readable: bool,
        /// Command and arguments to run instead of the configured ones
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a commented default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show the effective settings
    Show {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Check the settings and report every problem
    Validate,
    /// Show the default config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Run {
            port,
            user,
            machine_readable,
            command,
        } => {
            let mut settings = commands::load_settings(cli.config.as_ref())?;
            if let Some(port) = port {
                settings.local_port = Some(port);
            }
            if user.is_some() {
                settings.user = user;
            }
            if let Some((program, arguments)) = command.split_first() {
                settings.command = Some(program.clone());
                settings.arguments = arguments.to_vec();
            }
            let settings = settings.prepare()?;

            let ui = SerializedUi::new(Arc::new(
                ConsoleUi::new().machine_readable(machine_readable),
            ));
            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());

            if let Err(e) = commands::run_command(
                &settings,
                Arc::new(LocalCommunicator::new()),
                ui,
                cancel,
            )
            .await
            {
                print_error(&format!("{:#}", e));
                std::process::exit(1);
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                commands::config_init(cli.config.as_ref(), force)?;
            }
            ConfigAction::Show { json } => {
                commands::config_show(cli.config.as_ref(), json)?;
            }
            ConfigAction::Validate => {
                if !commands::config_validate(cli.config.as_ref())? {
                    std::process::exit(1);
                }
            }
            ConfigAction::Path => {
                println!("{}", sp_core::config::default_config_path().display());
            }
        },
    }

    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel.cancel();
    });
}
