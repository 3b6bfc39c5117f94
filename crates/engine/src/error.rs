//! Error types for the Oxflow engine.
//!
//! All fallible engine operations return [`EngineResult`]. The orchestrator
//! maps most of these errors into a FAILED execution; only repository/lock
//! failures are allowed to propagate out of the event loop.

use thiserror::Error;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Structural validation error (cycles, dangling dependencies, empty branch sets)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Expression rendering failure (conditions, templated fields)
    #[error("Template error: {0}")]
    Template(String),

    /// Missing flow, execution or task run
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Execution repository / lock backend error
    #[error("Repository error: {0}")]
    Repository(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(err: envy::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Validation(err.to_string())
    }
}
