//! Error types for settings and the device cache.
//!
//! Device and tool failures live in [`crate::moku::error`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors that can occur while reading or writing the device cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Cache file could not be read.
    #[error("failed to read device cache: {path}")]
    ReadError {
        /// Path to the cache file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Cache file is not valid JSON.
    #[error("failed to parse device cache: {path}")]
    ParseError {
        /// Path to the cache file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Cache file or directory could not be written.
    #[error("failed to write device cache: {path}")]
    WriteError {
        /// Path that could not be written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Cache contents could not be serialised.
    #[error("failed to serialise device cache")]
    Serialise(#[source] serde_json::Error),
}
