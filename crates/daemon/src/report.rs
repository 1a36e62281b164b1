//! Run reports
//!
//! Builds the [`RunReport`] for a finished run and writes reports out in the
//! layout-test text format (result text, metadata lines, `#EOF`).

use crate::config::ReportConfig;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use sky_harness_common::{RunId, RunReport, SingleTest, Verdict};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

/// A finished run as published to subscribers
#[derive(Debug, Clone)]
pub struct FinishedRun {
    pub report: RunReport,
    pub pixels: Bytes,
}

/// Check the pixel payload against the request
pub fn snapshot_mismatch(test: &SingleTest, pixels: &[u8]) -> Option<String> {
    match (test.is_snapshot, pixels.is_empty()) {
        (true, true) => Some("snapshot expected but no pixels were captured".to_string()),
        (false, false) => Some(format!(
            "{} bytes of pixels received for a text-only test",
            pixels.len()
        )),
        _ => None,
    }
}

/// Report for a run the engine completed
pub fn completion_report(run_id: RunId, test: SingleTest, result_text: String, pixels: Bytes) -> FinishedRun {
    let verdict = match snapshot_mismatch(&test, &pixels) {
        Some(reason) => Verdict::Inconsistent { reason },
        None => Verdict::Passed,
    };

    let pixels_sha256 = if pixels.is_empty() {
        None
    } else {
        Some(hex::encode(Sha256::digest(&pixels)))
    };

    FinishedRun {
        report: RunReport {
            run_id,
            test,
            verdict,
            result_text,
            pixels_len: pixels.len(),
            pixels_sha256,
            finished_at: chrono::Utc::now(),
        },
        pixels,
    }
}

/// Report for a run whose engine never completed
pub fn engine_failure_report(run_id: RunId, test: SingleTest, reason: String) -> FinishedRun {
    FinishedRun {
        report: RunReport {
            run_id,
            test,
            verdict: Verdict::EngineFailed { reason },
            result_text: String::new(),
            pixels_len: 0,
            pixels_sha256: None,
            finished_at: chrono::Utc::now(),
        },
        pixels: Bytes::new(),
    }
}

/// Text block for a report
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&report.result_text);
    if !report.result_text.is_empty() && !report.result_text.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("#TEST {}\n", report.test.path));
    out.push_str(&format!("#VERDICT {}\n", report.verdict));
    if let Some(sha) = &report.pixels_sha256 {
        out.push_str(&format!("#PIXELS sha256={} bytes={}\n", sha, report.pixels_len));
    }
    out.push_str("#EOF\n");
    out
}

/// Writes finished runs to stdout and/or an output directory
pub struct ReportWriter {
    config: ReportConfig,
}

impl ReportWriter {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }

    pub fn write(&self, finished: &FinishedRun) -> std::io::Result<()> {
        let text = format_report(&finished.report);

        if self.config.print {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            lock.write_all(text.as_bytes())?;
            lock.flush()?;
        }

        if let Some(dir) = &self.config.output_dir {
            std::fs::create_dir_all(dir)?;
            let stem = self.file_stem(&finished.report);

            std::fs::write(dir.join(format!("{}.txt", stem)), &text)?;
            if !finished.pixels.is_empty() {
                std::fs::write(dir.join(format!("{}.pixels", stem)), &finished.pixels)?;
            }
            debug!("Wrote report for run {} to {}", finished.report.run_id, dir.display());
        }

        Ok(())
    }

    /// `<run>-<test file name>`
    fn file_stem(&self, report: &RunReport) -> String {
        let name = PathBuf::from(&report.test.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "test".to_string());
        format!("{}-{}", report.run_id, name)
    }
}
