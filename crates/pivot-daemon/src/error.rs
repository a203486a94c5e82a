//! Error types for the Pivot daemon

use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors that can occur in the daemon outside of agent requests
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Agent operation error
    #[error("Agent error: {0}")]
    Agent(#[from] pivot_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Listener error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}

impl From<pivot_core::CatalogError> for DaemonError {
    fn from(e: pivot_core::CatalogError) -> Self {
        DaemonError::Config(e.to_string())
    }
}
