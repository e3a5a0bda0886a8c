//! Error types for the logging subsystem

use thiserror::Error;

/// Errors that can occur while configuring logging
#[derive(Debug, Error)]
pub enum LoggingError {
    /// A subscriber is already installed or setup otherwise failed
    #[error("logging initialization failed: {0}")]
    InitializationFailed(String),

    /// Unrecognized log level string
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
}
