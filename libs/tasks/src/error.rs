//! Error types for task payloads.

use thiserror::Error;

/// Errors raised while decoding or validating a task payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// A required field is missing or empty.
    #[error("{task}: {field} is required")]
    MissingField {
        task: &'static str,
        field: &'static str,
    },

    /// A field holds an out-of-range value.
    #[error("{task}: invalid {field}: {message}")]
    InvalidField {
        task: &'static str,
        field: &'static str,
        message: String,
    },

    /// The queue name is unknown.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Serialization(err.to_string())
    }
}
