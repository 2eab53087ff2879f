//! Error types for the simulation harness.

use overtake_core::{ConfigError, CoordinatorError};
use overtake_env::EnvError;
use thiserror::Error;

/// Errors raised while setting up or exporting a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid simulation config: {0}")]
    InvalidConfig(String),

    #[error("Overtaking config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
