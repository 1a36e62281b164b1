//! Core types for the Sky harness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifier of one run, unique for the lifetime of a runner
pub type RunId = u64;

/// One test request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleTest {
    /// Test document or script to load
    pub path: String,

    /// Whether the run must produce a pixel snapshot
    #[serde(default)]
    pub is_snapshot: bool,
}

impl SingleTest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_snapshot: false,
        }
    }

    pub fn snapshot(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_snapshot: true,
        }
    }

    /// Reject requests the engine could never load
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::InvalidTest("test path must not be empty".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Display for SingleTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_snapshot {
            write!(f, "{} (snapshot)", self.path)
        } else {
            write!(f, "{}", self.path)
        }
    }
}

/// Opaque input event (pointer, keyboard, ...).
///
/// The structure is defined by the engine's own protocol; the harness only
/// forwards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputEvent(pub serde_json::Value);

impl InputEvent {
    /// Event type, if the payload carries a `type` field
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(|v| v.as_str())
    }
}

/// Runner state as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Scheduled,
    Running,
}

impl Default for RunPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Scheduled => write!(f, "scheduled"),
            RunPhase::Running => write!(f, "running"),
        }
    }
}

/// Snapshot of the runner's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub state: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SingleTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub package_root: String,
    pub bindings: usize,
}

/// What happened to a dispatched input event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Delivered to the active engine connection
    Forwarded,
    /// Dropped because no engine connection was active
    Ignored,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    /// Completed and consistent with the request
    Passed,
    /// Completed, but the pixel payload contradicts `is_snapshot`
    Inconsistent { reason: String },
    /// The engine could not be started or went away before completing
    EngineFailed { reason: String },
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Passed => write!(f, "passed"),
            Verdict::Inconsistent { reason } => write!(f, "inconsistent: {}", reason),
            Verdict::EngineFailed { reason } => write!(f, "engine failed: {}", reason),
        }
    }
}

/// Result of one run, forwarded to the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub test: SingleTest,
    pub verdict: Verdict,
    #[serde(default)]
    pub result_text: String,
    #[serde(default)]
    pub pixels_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixels_sha256: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Whether the engine completed the run consistently
    pub fn is_success(&self) -> bool {
        matches!(self.verdict, Verdict::Passed)
    }
}
