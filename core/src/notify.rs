use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cfg::SlackConfig;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    /// Whether the channel accepted the message (or no channel is configured).
    pub ok: bool,
    /// Failure detail when `ok` is false.
    pub error: Option<String>,
}

impl SendOutcome {
    /// Accepted.
    pub fn delivered() -> Self {
        Self { ok: true, error: None }
    }

    /// Rejected or unreachable.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { ok: false, error: Some(error.into()) }
    }
}

/// Outbound text alerts. Implementations never fail the caller; problems are
/// reported in the returned [`SendOutcome`].
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `message` to the channel.
    async fn send(&self, message: &str) -> SendOutcome;
}

/// Send and log a failed outcome; used by components whose own status must
/// not depend on the channel.
pub async fn send_logged(notifier: &dyn Notifier, message: &str) -> SendOutcome {
    let outcome = notifier.send(message).await;
    if let Some(err) = &outcome.error {
        warn!(error = %err, "notification not delivered");
    }
    outcome
}

/// Slack `chat.postMessage` sink. Without a token every send is a logged no-op.
pub struct SlackNotifier {
    client: reqwest::Client,
    token: Option<String>,
    channel: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct SlackReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    /// Build from config; the HTTP client is created once and reused.
    pub fn new(cfg: &SlackConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            token: cfg.token.clone().filter(|t| !t.is_empty()),
            channel: cfg.channel.clone(),
            endpoint: POST_MESSAGE_URL.to_string(),
        }
    }

    /// Point at a different API endpoint (self-hosted proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Whether a token is configured.
    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, message: &str) -> SendOutcome {
        let Some(token) = &self.token else {
            info!("slack not configured, skipping notification");
            debug!("suppressed notification: {}", message);
            return SendOutcome::delivered();
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&json!({ "channel": self.channel, "text": message }))
            .send()
            .await;
        let resp = match resp.and_then(|r| r.error_for_status()) {
            Ok(r) => r,
            Err(e) => return SendOutcome::failed(format!("request_failed: {e}")),
        };
        match resp.json::<SlackReply>().await {
            Ok(SlackReply { ok: true, .. }) => {
                debug!(channel = %self.channel, "slack message sent");
                SendOutcome::delivered()
            }
            Ok(SlackReply { error, .. }) => {
                SendOutcome::failed(error.unwrap_or_else(|| "unknown_error".to_string()))
            }
            Err(e) => SendOutcome::failed(format!("bad_response: {e}")),
        }
    }
}
