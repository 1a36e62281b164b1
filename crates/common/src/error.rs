//! Error types for the Sky harness

use thiserror::Error;

/// Result type alias using the harness Error
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Contract violation between driver and engine, e.g. a second `start`
    /// while a run is in flight or a completion with no test running.
    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Invalid test: {0}")]
    InvalidTest(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("View host error: {0}")]
    View(String),

    /// Releasing an engine connection or view host failed. Fatal to the runner.
    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reported by the remote end of a harness connection
    #[error("{class}: {desc}")]
    Remote { class: String, desc: String },

    #[error("Test runner is no longer running")]
    ChannelClosed,
}

impl Error {
    /// Stable class name used on the wire
    pub fn class(&self) -> &str {
        match self {
            Error::Io(_) => "Io",
            Error::Serialization(_) => "Serialization",
            Error::Logic(_) => "LogicError",
            Error::InvalidTest(_) => "InvalidTest",
            Error::Engine(_) => "EngineError",
            Error::View(_) => "ViewError",
            Error::Teardown(_) => "TeardownFailed",
            Error::Protocol(_) => "Protocol",
            Error::Remote { class, .. } => class,
            Error::ChannelClosed => "RunnerClosed",
        }
    }

    /// Whether this error signals a broken driver/engine contract
    pub fn is_logic_error(&self) -> bool {
        match self {
            Error::Logic(_) => true,
            Error::Remote { class, .. } => class == "LogicError",
            _ => false,
        }
    }
}
