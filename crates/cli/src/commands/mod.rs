//! CLI Commands

pub mod run;
pub mod status;
