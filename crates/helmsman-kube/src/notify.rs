//! Run notifications

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

/// Receives plan and execution summaries; delivery failures are never fatal
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str, failed: bool);
}

/// Posts to a Slack incoming webhook
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook: String,
}

impl SlackNotifier {
    pub fn new(webhook: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            webhook: webhook.into(),
        })
    }

    async fn post(&self, text: &str, failed: bool) -> Result<(), String> {
        let payload = json!({
            "text": "Helmsman run report",
            "attachments": [{
                "color": if failed { "danger" } else { "good" },
                "text": text,
                "mrkdwn_in": ["text"],
            }],
        });
        let response = self
            .client
            .post(&self.webhook)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("HTTP {}: {}", status, body))
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, text: &str, failed: bool) {
        match self.post(text, failed).await {
            Ok(()) => debug!("Slack notification sent"),
            Err(e) => warn!("Failed to send Slack notification: {}", e),
        }
    }
}
