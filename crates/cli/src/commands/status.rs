//! Status and watch commands

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use sky_harness_common::{HarnessClient, RunReport, RunnerStatus};

use crate::output::{print_info, print_item, OutputFormat, TableDisplay};

/// Runner state display wrapper
#[derive(Serialize)]
pub struct StatusDisplay {
    pub state: String,
    pub test: String,
    pub run_id: String,
    pub package_root: String,
    pub bindings: usize,
}

impl From<RunnerStatus> for StatusDisplay {
    fn from(status: RunnerStatus) -> Self {
        Self {
            state: status.state.to_string(),
            test: status.test.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
            run_id: status.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            package_root: status.package_root,
            bindings: status.bindings,
        }
    }
}

impl TableDisplay for StatusDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["State", "Test", "Run", "Package Root", "Bindings"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.state.clone(),
            self.test.clone(),
            self.run_id.clone(),
            self.package_root.clone(),
            self.bindings.to_string(),
        ]
    }
}

/// Finished run display wrapper
#[derive(Serialize)]
pub struct ReportDisplay {
    pub run_id: u64,
    pub test: String,
    pub verdict: String,
    pub result: String,
    pub pixels: String,
    pub finished_at: String,
}

impl From<RunReport> for ReportDisplay {
    fn from(report: RunReport) -> Self {
        let pixels = match &report.pixels_sha256 {
            Some(sha) => format!("{}B sha256:{}", report.pixels_len, &sha[..sha.len().min(12)]),
            None => "-".to_string(),
        };

        Self {
            run_id: report.run_id,
            test: report.test.to_string(),
            verdict: report.verdict.to_string(),
            result: report.result_text.lines().next().unwrap_or_default().to_string(),
            pixels,
            finished_at: report.finished_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl TableDisplay for ReportDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Run", "Test", "Verdict", "Result", "Pixels", "Finished"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.run_id.to_string(),
            self.test.clone(),
            self.verdict.clone(),
            self.result.clone(),
            self.pixels.clone(),
            self.finished_at.clone(),
        ]
    }
}

#[derive(Parser)]
pub struct WatchArgs {
    /// Stop after this many finished runs
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

pub async fn status(client: &HarnessClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;
    print_item(&StatusDisplay::from(status), format);
    Ok(())
}

pub async fn watch(args: WatchArgs, client: &HarnessClient, format: OutputFormat) -> Result<()> {
    client.subscribe().await?;
    print_info(&format!("Watching {} for finished runs", client.socket_path().display()));

    let mut seen = 0;
    while args.count.map_or(true, |count| seen < count) {
        let report = client.next_report().await?;
        print_item(&ReportDisplay::from(report), format);
        seen += 1;
    }

    Ok(())
}
