//! Slack message posting.
//!
//! The core depends only on `SlackPoster::post_message`; concrete transports
//! are the chat.postMessage API (bot token) and incoming webhooks. Reminders
//! thread onto the recorded message timestamp when one exists.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("slack request failed: {0}")]
    Http(String),

    #[error("slack http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("slack error: {0}")]
    Api(String),
}

/// Channel and timestamp of a posted message, used for threading follow-ups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlackMessageResponse {
    pub channel: String,
    pub ts: String,
}

#[async_trait]
pub trait SlackPoster: Send + Sync {
    async fn post_message(&self, payload: Value) -> Result<SlackMessageResponse, SlackError>;
}

/// Posts through Slack's chat.postMessage API using a bot token.
pub struct SlackApiPoster {
    client: reqwest::Client,
    token: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    ts: String,
}

impl SlackApiPoster {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            endpoint: "https://slack.com/api/chat.postMessage".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SlackPoster for SlackApiPoster {
    async fn post_message(&self, payload: Value) -> Result<SlackMessageResponse, SlackError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SlackError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SlackError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(SlackError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ApiResponse =
            serde_json::from_str(&body).map_err(|e| SlackError::Http(e.to_string()))?;
        if !parsed.ok {
            let reason = if parsed.error.is_empty() {
                "unknown_error".to_string()
            } else {
                parsed.error
            };
            return Err(SlackError::Api(reason));
        }
        Ok(SlackMessageResponse {
            channel: parsed.channel,
            ts: parsed.ts,
        })
    }
}

/// Posts through an incoming webhook. Webhooks return no thread metadata.
pub struct SlackWebhookPoster {
    client: reqwest::Client,
    url: String,
}

impl SlackWebhookPoster {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl SlackPoster for SlackWebhookPoster {
    async fn post_message(&self, payload: Value) -> Result<SlackMessageResponse, SlackError> {
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SlackError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SlackError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(SlackMessageResponse::default())
    }
}

/// Stand-in when no Slack transport is configured. Messages are logged and
/// dropped so the rest of the pipeline keeps working in dev setups.
pub struct NoopSlackPoster;

#[async_trait]
impl SlackPoster for NoopSlackPoster {
    async fn post_message(&self, payload: Value) -> Result<SlackMessageResponse, SlackError> {
        tracing::debug!(payload = %payload, "slack not configured, dropping message");
        Ok(SlackMessageResponse::default())
    }
}

/// Block Kit section with mrkdwn text.
pub fn section_block(text: &str) -> Value {
    json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": text},
    })
}

/// Block Kit button carrying a JSON context in its value.
pub fn button_block(label: &str, style: &str, action: &str, value: &str) -> Value {
    let mut button = json!({
        "type": "button",
        "text": {"type": "plain_text", "text": label},
        "action_id": action,
        "value": value,
    });
    if !style.is_empty() {
        button["style"] = json!(style);
    }
    button
}
