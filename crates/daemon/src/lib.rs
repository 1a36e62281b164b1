//! Sky Harness Daemon
//!
//! Orchestrates single rendering-engine test runs on behalf of a driver:
//! one runner owns all state, clients bind to it over a Unix socket, and the
//! engine reports completion back through its own binding.
//!
//! # Architecture
//!
//! ```text
//! driver ──┐                        ┌──► ViewHost (one per run)
//!          ├─► service ─► bindings ─► TestRunner
//! engine ──┘    (socket)             └──► EngineConnection (one per run)
//!                                          │
//!                     EngineLost ◄─────────┘ (cancelled at teardown)
//! ```

pub mod bindings;
pub mod config;
pub mod engine;
pub mod report;
pub mod runner;
pub mod service;
pub mod testing;
pub mod view;

pub use bindings::{BindingId, HarnessBinding};
pub use config::HarnessConfig;
pub use runner::{RunnerHandle, TestRunner};
