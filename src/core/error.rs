//! Unified error handling for scoutgate
//!
//! Admission denial, cache misses and empty session queues are expected
//! steady-state outcomes and are signalled through return values. Only the
//! conditions below surface as errors.

use std::fmt;

/// Unified error type for the admission, cache, session and transport layers
#[derive(Debug)]
pub enum ScoutError {
    /// Request payload or parameter validation errors
    Validation(String),

    /// Session identifier is empty, too long or contains illegal characters
    InvalidSessionId(String),

    /// Event or cached value could not be (de)serialized
    Serialization(serde_json::Error),

    /// The external worker failed to produce a result
    Worker(String),

    /// The storage collaborator failed to persist a result
    Storage(String),

    /// A source can never admit another call (zero refill rate, empty bucket)
    AdmissionUnavailable(String),
}

impl fmt::Display for ScoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoutError::Validation(msg) => write!(f, "Validation error: {msg}"),
            ScoutError::InvalidSessionId(id) => write!(f, "Invalid session id: {id:?}"),
            ScoutError::Serialization(err) => write!(f, "Serialization error: {err}"),
            ScoutError::Worker(msg) => write!(f, "Worker error: {msg}"),
            ScoutError::Storage(msg) => write!(f, "Storage error: {msg}"),
            ScoutError::AdmissionUnavailable(source) => {
                write!(f, "Source {source} can no longer admit calls")
            }
        }
    }
}

impl std::error::Error for ScoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScoutError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ScoutError {
    fn from(err: serde_json::Error) -> Self {
        ScoutError::Serialization(err)
    }
}

/// Result type alias for scoutgate operations
pub type ScoutResult<T> = std::result::Result<T, ScoutError>;
