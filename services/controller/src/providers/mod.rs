//! Remote provider clients.
//!
//! The controller talks to two external systems:
//! - a compute API that creates and deletes instances ([`ComputeProvider`])
//! - a bot fleet API that tracks the workers running on them ([`BotProvider`])
//!
//! Both report failures as [`ApiError`]. Handlers only depend on the traits;
//! [`GceClient`] and [`SwarmingClient`] speak HTTP, and the fakes in
//! [`fake`] run in process.

mod compute;
pub mod fake;
mod fleet;

pub use compute::{
    ComputeProvider, GceClient, InsertInstance, Instance, InstanceAccessConfig,
    InstanceNetworkInterface, Operation, OperationError, OperationStatus, Quota, Region,
};
pub use fleet::{BotEvent, BotInfo, BotProvider, SwarmingClient, BOT_TERMINATE_EVENT};

use serde::Deserialize;
use thiserror::Error;

/// Structured error returned by a provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider error {code}: {message}")]
pub struct ApiError {
    /// HTTP status; 0 when no response was received.
    pub code: u16,
    pub message: String,
    /// Additional messages from the response.
    pub details: Vec<String>,
    /// The provider reported a rate limit.
    pub rate_limited: bool,
}

impl ApiError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            rate_limited: false,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            rate_limited: true,
            ..Self::new(429, message)
        }
    }

    /// The request never produced a response.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::new(0, err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    /// Whether the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        self.rate_limited || self.code == 0 || self.code == 429 || self.code >= 500
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::new(status.as_u16(), err.to_string()),
            None => Self::transport(err),
        }
    }
}

/// Reasons that mark a response as rate limited.
const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Turn a non-success response into an [`ApiError`].
pub(crate) async fn error_from_response(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    parse_error_body(status, &body)
}

fn parse_error_body(status: u16, body: &str) -> ApiError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.error.message.is_empty() {
        body.trim().to_string()
    } else {
        parsed.error.message
    };
    let rate_limited = parsed
        .error
        .errors
        .iter()
        .any(|item| RATE_LIMIT_REASONS.contains(&item.reason.as_str()));

    ApiError {
        code: status,
        message,
        details: parsed
            .error
            .errors
            .into_iter()
            .map(|item| item.message)
            .filter(|m| !m.is_empty())
            .collect(),
        rate_limited,
    }
}
