//! Sky Harness CLI
//!
//! Command-line driver for the harness daemon: query state, start runs,
//! report completion, forward input and watch finished runs.

pub mod commands;
pub mod output;
