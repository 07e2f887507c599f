//! Core error types

use thiserror::Error;

/// Core error type for AeroTask
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is structurally valid but semantically inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),

    /// Unknown enumeration value in configuration or records
    #[error("Unknown {kind}: {value}")]
    UnknownValue {
        /// What was being parsed
        kind: &'static str,
        /// Offending input
        value: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
