//! Shared utilities

pub mod error;

pub use error::{ErrorResponse, FinalizeError, RecorderError, RecorderResult, SinkError, WriteError};
