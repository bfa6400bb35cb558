//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::orchestrator::error::OrchestratorError;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Configuration and catalog errors. Always fatal to the request that hit them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid integration catalog {}: {reason}", path.display())]
    Catalog { path: PathBuf, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
