//! Bot fleet provider.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{error_from_response, ApiError};

/// Event type a bot reports when it has been asked to shut down.
pub const BOT_TERMINATE_EVENT: &str = "bot_terminate";

/// A bot registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BotInfo {
    pub bot_id: String,
    pub deleted: bool,
    pub is_dead: bool,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl BotInfo {
    /// A healthy bot first seen at `first_seen`.
    pub fn alive(bot_id: impl Into<String>, first_seen: Option<DateTime<Utc>>) -> Self {
        Self {
            bot_id: bot_id.into(),
            first_seen,
            last_seen: first_seen,
            ..Default::default()
        }
    }
}

/// One lifecycle event of a bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotEvent {
    pub event_type: String,
    pub ts: Option<DateTime<Utc>>,
}

impl BotEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ts: None,
        }
    }

    pub fn is_terminate(&self) -> bool {
        self.event_type == BOT_TERMINATE_EVENT
    }
}

/// Bot fleet provider. Bots are addressed by (server, hostname).
#[async_trait]
pub trait BotProvider: Send + Sync {
    async fn get_bot(&self, server: &str, hostname: &str) -> Result<BotInfo, ApiError>;

    /// Recent events, newest first.
    async fn list_bot_events(&self, server: &str, hostname: &str)
        -> Result<Vec<BotEvent>, ApiError>;

    /// Ask the bot to shut down after its current work.
    async fn terminate_bot(&self, server: &str, hostname: &str) -> Result<(), ApiError>;

    /// Remove the bot registration.
    async fn delete_bot(&self, server: &str, hostname: &str) -> Result<(), ApiError>;
}

// =============================================================================
// HTTP client
// =============================================================================

/// Swarming v1 REST client.
///
/// The server is taken from each VM, so one client serves every config.
pub struct SwarmingClient {
    client: reqwest::Client,
    access_token: Option<String>,
}

impl SwarmingClient {
    pub fn new(access_token: Option<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            access_token,
        })
    }

    /// `server` may be a bare hostname or a full base URL.
    fn url(server: &str, hostname: &str, action: &str) -> String {
        let base = if server.starts_with("http://") || server.starts_with("https://") {
            server.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", server.trim_end_matches('/'))
        };
        format!("{base}/_ah/api/swarming/v1/bot/{hostname}/{action}")
    }

    async fn call(
        &self,
        method: reqwest::Method,
        server: &str,
        hostname: &str,
        action: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let url = Self::url(server, hostname, action);
        debug!(url = %url, "Calling bot server");

        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl BotProvider for SwarmingClient {
    async fn get_bot(&self, server: &str, hostname: &str) -> Result<BotInfo, ApiError> {
        let response = self
            .call(reqwest::Method::GET, server, hostname, "get")
            .await?;
        let bot: BotResource = response.json().await?;
        Ok(bot.into())
    }

    async fn list_bot_events(
        &self,
        server: &str,
        hostname: &str,
    ) -> Result<Vec<BotEvent>, ApiError> {
        let response = self
            .call(reqwest::Method::GET, server, hostname, "events")
            .await?;
        let events: EventList = response.json().await?;
        Ok(events
            .items
            .into_iter()
            .map(|e| BotEvent {
                event_type: e.event_type,
                ts: e.ts.as_deref().and_then(parse_timestamp),
            })
            .collect())
    }

    async fn terminate_bot(&self, server: &str, hostname: &str) -> Result<(), ApiError> {
        self.call(reqwest::Method::POST, server, hostname, "terminate")
            .await?;
        Ok(())
    }

    async fn delete_bot(&self, server: &str, hostname: &str) -> Result<(), ApiError> {
        self.call(reqwest::Method::POST, server, hostname, "delete")
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BotResource {
    bot_id: String,
    deleted: bool,
    is_dead: bool,
    first_seen_ts: Option<String>,
    last_seen_ts: Option<String>,
}

impl From<BotResource> for BotInfo {
    fn from(bot: BotResource) -> Self {
        Self {
            bot_id: bot.bot_id,
            deleted: bot.deleted,
            is_dead: bot.is_dead,
            first_seen: bot.first_seen_ts.as_deref().and_then(parse_timestamp),
            last_seen: bot.last_seen_ts.as_deref().and_then(parse_timestamp),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventList {
    items: Vec<EventResource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventResource {
    event_type: String,
    ts: Option<String>,
}

/// Parse RFC 3339, or a zone-less timestamp taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| ts.and_utc())
}
