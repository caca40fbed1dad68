//! k-Bridge CLI
//!
//! Connects a developer machine to a Kubernetes namespace:
//! - `up` runs a session until it ends or is interrupted
//! - `restore` undoes what a crashed session left behind
//! - `config` manages the session file

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use k_bridge::commands;
use k_bridge::output::print_error;

#[derive(Parser)]
#[command(name = "k-bridge")]
#[command(author, version, about = "Bridge a local machine and a Kubernetes namespace")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the session file
    #[arg(short, long, global = true, env = "K_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session: swap services and forward traffic until Ctrl+C
    Up {
        /// Namespace to work in (overrides the session file)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Restore services and remove bridge pods left by a crashed session
    ///
    /// Sessions whose bridge pod is still Ready are skipped unless named
    /// with --session or included with --force.
    Restore {
        /// Namespace to work in (overrides the session file)
        #[arg(short, long)]
        namespace: Option<String>,
        /// Only restore this session (full id or the short id shown by `up`)
        #[arg(short, long)]
        session: Option<String>,
        /// Also restore sessions whose bridge pod is still running
        #[arg(short, long, conflicts_with = "session")]
        force: bool,
    },

    /// Manage the session file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective session configuration
    Show,
    /// Write a starter session file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the session file location
    Path,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose, cli.log_level.as_deref()) {
        (true, _, _) => "error",
        (false, 0, Some(level)) => level,
        (false, 0, None) => "warn",
        (false, 1, _) => "info",
        (false, 2, _) => "debug",
        (false, _, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Up { namespace } => commands::up_command(config, namespace).await,
        Commands::Restore {
            namespace,
            session,
            force,
        } => {
            let options = commands::RestoreOptions { session, force };
            commands::restore_command(config, namespace, options).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(config),
            ConfigAction::Init { force } => commands::config_init(config, force),
            ConfigAction::Path => {
                commands::config_path(config);
                Ok(())
            }
        },
    }
}
