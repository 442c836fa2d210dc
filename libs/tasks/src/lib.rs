//! # vmfleet-tasks
//!
//! Task payloads and queue vocabulary for the vmfleet controller.
//!
//! ## Design Principles
//!
//! - Every payload kind has exactly one named queue
//! - Payloads are plain data; handlers are selected by an explicit match
//! - Delivery is at-least-once, so every payload must be safe to replay
//! - Malformed payloads are rejected before any handler runs
//!
//! ## Task Envelope
//!
//! Queues carry a [`TaskEnvelope`]: the payload plus its task id, queue,
//! attempt count, and enqueue time.

mod envelope;
mod error;
mod retry;
mod types;

pub use envelope::TaskEnvelope;
pub use error::TaskError;
pub use retry::RetryPolicy;
pub use types::*;
