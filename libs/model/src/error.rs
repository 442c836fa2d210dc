//! Error types for model validation and schedule evaluation.

use thiserror::Error;

/// Errors raised by model validation and schedule evaluation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A schedule time is not in `HH:MM` form.
    #[error("invalid time of day '{0}': expected HH:MM")]
    InvalidTime(String),

    /// A schedule location is not a known IANA time zone.
    #[error("unknown time zone '{0}'")]
    InvalidLocation(String),

    /// A schedule start does not exist in its time zone (DST gap).
    #[error("start time {time} does not exist in '{location}'")]
    NonexistentStart { time: String, location: String },

    /// Amount bounds are inconsistent.
    #[error("invalid amount: min {min} exceeds max {max}")]
    InvalidBounds { min: i32, max: i32 },

    /// A negative bound or length was supplied.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}
