//! Error types for labscope operations

use std::sync::Arc;
use thiserror::Error;

/// Errors raised while decoding a telemetry file
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u16),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Truncated sample data for channel {channel}: expected {expected} bytes, got {actual}")]
    TruncatedData {
        channel: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid byte range: {0}")]
    InvalidByteRange(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("IO error: {0}")]
    IoFailure(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::IoFailure(Arc::new(err))
    }
}

/// Errors raised by derived channel formulas
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalcError {
    #[error("Input length mismatch: expected {expected} samples, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Inputs do not share a time base")]
    TimeBaseMismatch,

    #[error("Unknown formula: {0}")]
    UnknownFormula(String),

    #[error("Formula {formula} expects {expected} inputs, got {actual}")]
    Arity {
        formula: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("Invalid formula parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown source channel: {0}")]
    UnknownSource(String),
}

/// Request parameters rejected before any I/O happens
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("maxPoints must be between 1 and {limit}, got {requested}")]
    MaxPoints { requested: usize, limit: usize },

    #[error("endMs ({end}) must be greater than startMs ({start})")]
    TimeRange { start: f64, end: f64 },

    #[error("Time bound is not a finite number: {0}")]
    NonFiniteTime(f64),

    #[error("At least one channel must be requested")]
    NoChannels,
}

/// Main error type for labscope
#[derive(Error, Debug, Clone)]
pub enum LabError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Calc(#[from] CalcError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Native engine not loaded: {0}")]
    EngineNotLoaded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl LabError {
    /// Whether retrying the same request may succeed.
    ///
    /// Malformed files and bad parameters stay broken; I/O failures and
    /// aborted background tasks do not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LabError::Codec(CodecError::IoFailure(_)) | LabError::Task(_)
        )
    }

    /// Whether the error means the requested data does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LabError::NotFound(_) | LabError::Codec(CodecError::ChannelNotFound(_))
        )
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        LabError::Codec(CodecError::from(err))
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        LabError::Configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LabError {
    fn from(err: tokio::task::JoinError) -> Self {
        LabError::Task(err.to_string())
    }
}

/// Specialized Result type for labscope operations
pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = LabError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "share dropped",
        ));
        assert!(io.is_transient());

        let malformed = LabError::from(CodecError::MalformedHeader("short".into()));
        assert!(!malformed.is_transient());
        assert!(!malformed.is_not_found());

        let missing = LabError::NotFound("exp-1".into());
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_errors_are_cloneable_with_source() {
        let err = CodecError::from(std::io::Error::other("boom"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(std::error::Error::source(&cloned).is_some());
    }
}
