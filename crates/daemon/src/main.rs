//! Sky Harness Daemon
//!
//! Runs the test runner and serves the harness interface.

use anyhow::Context;
use clap::Parser;
use sky_harness_common::SingleTest;
use sky_harness_daemon::config::HarnessConfig;
use sky_harness_daemon::engine::ProcessEngineHost;
use sky_harness_daemon::report::ReportWriter;
use sky_harness_daemon::service::HarnessService;
use sky_harness_daemon::view::OffscreenViewFactory;
use sky_harness_daemon::TestRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sky-harnessd")]
#[command(about = "Sky harness daemon - runs one rendering-engine test at a time")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Harness socket path
    #[arg(short, long, env = "SKY_HARNESS_SOCKET")]
    socket: Option<PathBuf>,

    /// Package root used to resolve test assets
    #[arg(short, long)]
    package_root: Option<String>,

    /// Run this test once at startup
    #[arg(short, long)]
    test: Option<String>,

    /// The startup test produces a pixel snapshot
    #[arg(long, requires = "test")]
    snapshot: bool,

    /// Engine host binary
    #[arg(short, long)]
    engine: Option<PathBuf>,

    /// Directory for report files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop after the first finished run
    #[arg(long)]
    exit_after_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Reports go to stdout, so logs go to stderr.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    info!("Sky harness daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(sky_harness_common::default_config_path);
    let mut config = HarnessConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(root) = cli.package_root {
        config.package_root = root;
    }
    if let Some(engine) = cli.engine {
        config.engine.binary = engine;
    }
    if let Some(output) = cli.output {
        config.report.output_dir = Some(output);
    }

    let views = Arc::new(OffscreenViewFactory::new(config.view.clone()));
    let engines = Arc::new(ProcessEngineHost::new(
        config.engine.clone(),
        config.socket_path.clone(),
    ));
    let (runner, handle) = TestRunner::new(views.clone(), engines);
    let mut runner_task = tokio::spawn(runner.run());

    handle.set_package_root(config.package_root.clone())?;

    let service = HarnessService::bind(&config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;
    let shutdown = CancellationToken::new();
    let mut service_task = tokio::spawn(service.serve(handle.clone(), shutdown.clone()));

    let writer = ReportWriter::new(config.report.clone());
    let mut reports = handle.subscribe();

    let single_test = cli.test.map(|path| SingleTest {
        path,
        is_snapshot: cli.snapshot,
    });
    handle.start(single_test).await?;

    let mut failed_run = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            finished = reports.recv() => {
                match finished {
                    Ok(finished) => {
                        writer.write(&finished)?;
                        if cli.exit_after_run {
                            if !finished.report.is_success() {
                                failed_run = Some(finished.report);
                            }
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => warn!("Report writer missed {} reports", missed),
                    Err(RecvError::Closed) => break,
                }
            }
            result = &mut service_task => {
                shutdown.cancel();
                result.context("harness service panicked")??;
                anyhow::bail!("harness service stopped unexpectedly");
            }
            result = &mut runner_task => {
                shutdown.cancel();
                let result = result.context("test runner panicked")?;
                if let Err(e) = &result {
                    error!("Test runner stopped: {}", e);
                }
                return Ok(result?);
            }
        }
    }

    shutdown.cancel();
    handle.shutdown().await?;
    runner_task.await.context("test runner panicked")??;
    service_task.await.context("harness service panicked")??;

    if views.live_surfaces() != 0 {
        warn!("{} surfaces still alive at exit", views.live_surfaces());
    }
    info!("Harness shutdown complete");

    if let Some(report) = failed_run {
        anyhow::bail!("run {} ({}) {}", report.run_id, report.test, report.verdict);
    }
    Ok(())
}
