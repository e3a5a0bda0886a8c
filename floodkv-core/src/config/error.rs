//! Error types for configuration loading and validation

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is absent or empty
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A field holds a value the store cannot run with
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// The config document failed to parse
    #[error("config parse error: {0}")]
    Parse(String),
}
