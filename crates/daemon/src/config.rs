//! Harness configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Harness daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Unix socket the harness interface listens on
    pub socket_path: PathBuf,

    /// Asset-resolution root handed to the engine on load
    pub package_root: String,

    /// Engine process configuration
    pub engine: EngineConfig,

    /// Offscreen view configuration
    pub view: ViewConfig,

    /// Report output configuration
    pub report: ReportConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            socket_path: sky_harness_common::default_socket_path(),
            package_root: String::new(),
            engine: EngineConfig::default(),
            view: ViewConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

/// Engine-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the engine host binary
    pub binary: PathBuf,

    /// Extra arguments passed before the harness-provided environment
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// How long a terminated engine may take to exit before it is killed
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("sky_shell"),
            args: Vec::new(),
            env: HashMap::new(),
            shutdown_grace_ms: 2000,
        }
    }
}

/// Offscreen surface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub width: u32,
    pub height: u32,
    pub device_pixel_ratio: f32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            device_pixel_ratio: 1.0,
        }
    }
}

/// Where run reports go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory receiving `<run>.txt` and `<run>.pixels` files
    pub output_dir: Option<PathBuf>,

    /// Print each report to stdout, terminated by `#EOF`
    pub print: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            print: true,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Engine shutdown grace period
    pub fn engine_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.engine.shutdown_grace_ms)
    }
}
