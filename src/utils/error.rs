//! Error types and handling
//!
//! Error taxonomy shared by the recording session, the writer pool and the
//! concrete sinks.

use crate::recorder::state::RecordingState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a concrete sink (encoder + file handle)
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Sink is not prepared")]
    NotPrepared,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Audio format mismatch: sink encodes {expected}, sample is {actual}")]
    FormatMismatch { expected: String, actual: String },
}

/// A single sample failed to reach its sink.
///
/// Write errors never abort a recording; they are logged and counted per writer.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Writer {0} is not ready")]
    NotReady(String),

    #[error("Writer {0} is closed")]
    Closed(String),

    #[error("Non-monotonic sample time on {writer}: {time_ms:.3}ms after {last_ms:.3}ms")]
    NonMonotonic {
        writer: String,
        time_ms: f64,
        last_ms: f64,
    },

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// A sink failed to close or flush its output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to finalize {sink}: {message}")]
pub struct FinalizeError {
    pub sink: String,
    pub message: String,
}

impl FinalizeError {
    pub fn new(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            message: message.into(),
        }
    }
}

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: RecordingState,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error("Recording session was disposed")]
    Disposed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(String),
}

impl RecorderError {
    pub(crate) fn invalid_state(operation: &'static str, state: RecordingState) -> Self {
        Self::InvalidState { operation, state }
    }
}

/// Error response for a host control layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        let code = match &error {
            RecorderError::Configuration(_) => "CONFIGURATION_ERROR",
            RecorderError::InvalidState { .. } => "INVALID_STATE",
            RecorderError::Write(_) => "WRITE_ERROR",
            RecorderError::Finalize(_) => "FINALIZE_ERROR",
            RecorderError::Disposed => "DISPOSED",
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::Serialization(_) => "SERIALIZATION_ERROR",
            RecorderError::Image(_) => "IMAGE_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;
