//! Custom error types for the engine.
//!
//! This module defines the primary error type, `EngineError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of faults the engine can hit,
//! from I/O and configuration issues to control-bus problems.
//!
//! Two families deserve a note:
//!
//! - **Configuration errors** (`Configuration`, `NoSignalsInUse`,
//!   `RunDirectoryExists`) fail a sequence before the hardware is touched.
//! - **Decode diagnostics are not errors.** Per-block loss or malformation in
//!   the packet codec is returned as data (see [`crate::codec`]); only the
//!   aggregate nonzero count surfaces here, as `DegradedDecode`, after all
//!   artifacts and headers have been written.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control-bus error: {0}")]
    Bus(String),

    #[error("Remote value disconnected: {0}")]
    Disconnected(String),

    #[error("No signals in use, check CCCR")]
    NoSignalsInUse,

    #[error("Run directory already exists: {0}")]
    RunDirectoryExists(std::path::PathBuf),

    #[error("Header document error: {0}")]
    Header(#[from] serde_json::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Decode completed with {0} diagnostics")]
    DegradedDecode(usize),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
