//! Error types for segue-player
//!
//! Operational failures (network, decode) are reported through the controller's
//! `error` event and never abort the scheduling loop. Usage errors are returned
//! directly to the caller.

use thiserror::Error;

/// Main error type for segue-player
#[derive(Error, Debug)]
pub enum Error {
    /// Segment or manifest could not be fetched
    ///
    /// Sticky per segment: a failed segment is never fetched again.
    #[error("Load failed for {url}: {reason}")]
    Load { url: String, reason: String },

    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// Operation was aborted (seek, teardown)
    #[error("Operation cancelled")]
    Cancelled,

    /// Manifest could not be parsed
    #[error("Failed to parse m3u8 {src}: {reason}")]
    Protocol { src: String, reason: String },

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio clock or node errors
    #[error("Audio context error: {0}")]
    AudioContext(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid timing parameters
    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    /// Configuration loading errors
    #[error(transparent)]
    Config(#[from] segue_common::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Load,
    Cancellation,
    Protocol,
    Precondition,
    Decode,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Load { .. } | Error::Http { .. } => ErrorKind::Load,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::InvalidState(_) | Error::InvalidTiming(_) => ErrorKind::Precondition,
            Error::Decode(_) => ErrorKind::Decode,
            Error::AudioContext(_) | Error::Config(_) | Error::Io(_) | Error::Internal(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Cancellations are expected during seek and teardown and are not reported
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Convenience Result type using segue-player Error
pub type Result<T> = std::result::Result<T, Error>;
