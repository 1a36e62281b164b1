//! Run control commands

use anyhow::{Context, Result};
use clap::Parser;
use sky_harness_common::{DispatchOutcome, HarnessClient, InputEvent, SingleTest};
use std::path::PathBuf;

use crate::commands::status::ReportDisplay;
use crate::output::{print_error, print_item, print_message, print_success, OutputFormat};

#[derive(Parser)]
pub struct RootArgs {
    /// Asset-resolution root for later runs
    pub path: String,
}

#[derive(Parser)]
pub struct StartArgs {
    /// Test to run; omit to start the runner idle
    pub test: Option<String>,

    /// The test produces a pixel snapshot
    #[arg(long, requires = "test")]
    pub snapshot: bool,
}

#[derive(Parser)]
pub struct CompleteArgs {
    /// Result text reported by the engine
    pub text: String,

    /// Raw pixel payload for snapshot tests
    #[arg(long)]
    pub pixels_file: Option<PathBuf>,
}

#[derive(Parser)]
pub struct InputArgs {
    /// Input event as JSON, e.g. '{"type":"pointer_down","x":10,"y":20}'
    pub event: String,
}

pub async fn root(args: RootArgs, client: &HarnessClient, format: OutputFormat) -> Result<()> {
    client.set_package_root(args.path.clone()).await?;
    print_message(&format!("Package root set to {}", args.path), format);
    Ok(())
}

pub async fn start(args: StartArgs, client: &HarnessClient, format: OutputFormat) -> Result<()> {
    let test = args.test.map(|path| SingleTest {
        path,
        is_snapshot: args.snapshot,
    });
    let described = test
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "no test".to_string());

    let phase = client.start(test).await?;
    print_message(&format!("Runner {} ({})", phase, described), format);
    Ok(())
}

pub async fn complete(args: CompleteArgs, client: &HarnessClient, format: OutputFormat) -> Result<()> {
    let pixels = match &args.pixels_file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => Vec::new(),
    };

    let report = client.on_test_complete(args.text, pixels).await?;
    let success = report.is_success();
    print_item(&ReportDisplay::from(report), format);

    if !success {
        print_error("Run finished with an inconsistent result");
        std::process::exit(1);
    }
    Ok(())
}

pub async fn input(args: InputArgs, client: &HarnessClient) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(&args.event).context("input event must be JSON")?;

    match client.dispatch_input_event(InputEvent(value)).await? {
        DispatchOutcome::Forwarded => print_success("Input event forwarded"),
        DispatchOutcome::Ignored => print_error("No test running; input event ignored"),
    }
    Ok(())
}
