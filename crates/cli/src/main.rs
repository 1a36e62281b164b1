//! Sky Harness CLI - Main Entry Point
//!
//! Drives the harness daemon over its Unix socket.

use clap::{Parser, Subcommand};
use sky_harness_common::HarnessClient;
use std::path::PathBuf;

use sky_harness_cli::commands::{run, status};
use sky_harness_cli::output::{self, print_error};

/// Sky Harness CLI
#[derive(Parser)]
#[command(name = "sky-harness")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Harness socket path
    #[arg(long, env = "SKY_HARNESS_SOCKET", global = true)]
    socket: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show runner state
    Status,

    /// Set the package root for later runs
    Root(run::RootArgs),

    /// Start the runner, optionally with a test
    Start(run::StartArgs),

    /// Report completion of the current run
    Complete(run::CompleteArgs),

    /// Forward an input event to the running engine
    Input(run::InputArgs),

    /// Print finished runs as they arrive
    Watch(status::WatchArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let socket = cli
        .socket
        .unwrap_or_else(sky_harness_common::default_socket_path);
    let client = HarnessClient::connect(&socket).await;
    if let Ok(client) = &client {
        tracing::debug!(
            "Bound as {} (daemon v{})",
            client.binding_id(),
            client.server_version()
        );
    }

    match cli.command {
        Commands::Status => match client {
            Ok(client) => status::status(&client, cli.format).await?,
            Err(e) => {
                print_error(&format!("Cannot connect to harness at {}: {}", socket.display(), e));
                std::process::exit(1);
            }
        },
        Commands::Root(args) => run::root(args, &client?, cli.format).await?,
        Commands::Start(args) => run::start(args, &client?, cli.format).await?,
        Commands::Complete(args) => run::complete(args, &client?, cli.format).await?,
        Commands::Input(args) => run::input(args, &client?).await?,
        Commands::Watch(args) => status::watch(args, &client?, cli.format).await?,
        Commands::Version => {
            println!("Sky Harness CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Protocol: newline-delimited JSON over {}", socket.display());
        }
    }

    Ok(())
}
