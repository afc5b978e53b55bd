//! Downstream chat notifier.
//!
//! The webhook accepts `{"text": "..."}`; only the status code of the answer is
//! looked at.

use crate::error::NotifierError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Sends a chat message somewhere.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), NotifierError>;

    /// Notifier name for logging and breaker naming.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Slack incoming-webhook notifier.
#[derive(Debug, Clone)]
pub struct SlackWebhookNotifier {
    webhook_url: String,
    client: Client,
}

impl SlackWebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, NotifierError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifierError> {
        debug!(chars = text.len(), "Posting to Slack webhook");

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&WebhookPayload { text })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!("Notification sent to Slack");
            Ok(())
        } else {
            Err(NotifierError::Status(status.as_u16()))
        }
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

/// Logs messages instead of sending them, used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifierError> {
        info!(text, "Webhook not configured, skipping notification");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
