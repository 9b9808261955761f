//! Error types for configuration handling.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::Config`].
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("failed to write config file {path}: {source}")]
    Write {
        /// Path that was written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The pattern is already in the blacklist.
    #[error("pattern {0} already in blacklist")]
    DuplicatePattern(String),

    /// The pattern is not in the blacklist.
    #[error("pattern {0} not found in blacklist")]
    PatternNotFound(String),

    /// A blank pattern was supplied.
    #[error("pattern must not be empty")]
    EmptyPattern,

    /// The listen port is invalid.
    #[error("invalid proxy port: {0}")]
    InvalidPort(u16),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
