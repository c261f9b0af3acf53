//! Common error types for stratum-client.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the underlying error types used throughout the crate.

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::stratum::StratumError;

/// Main error type for stratum-client operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Line framing errors (over-long line, socket failure mid-line)
    #[error("Framing error: {0}")]
    Codec(#[from] LinesCodecError),

    /// Dial failed or no transport is open
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Pool closed the connection
    #[error("Connection lost")]
    Disconnected,

    /// Unexpected message shape or field type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Job payload rejected by the work decoder
    #[error("Validation error: {0}")]
    Validation(String),

    /// Pool answered with a populated error object
    #[error("Pool error: {0}")]
    Pool(#[from] StratumError),

    /// Pool refused the credentials
    #[error("Authorization failed: {0}")]
    Authentication(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
