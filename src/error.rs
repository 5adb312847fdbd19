//! Error types for the Tollgate governance layer.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid bound, rate or replacement token in the configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A redaction pattern failed to compile
    #[error("Invalid redaction pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Layered configuration sources could not be read or merged
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// An optimization decision could not be applied
    #[error("Failed to apply {action}: {reason}")]
    Apply { action: String, reason: String },

    /// Background work needs a tokio runtime that is not available
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
