//! Terminal-outcome notifiers.
//!
//! A notifier is told about every job outcome that is final for its window
//! (`Succeeded`, final `Failed`, `Skipped`). Delivery failures are the
//! caller's to log; they never affect the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{RunState, TerminalEvent};

/// Receives terminal job outcomes
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TerminalEvent) -> Result<()>;
}

/// Writes outcomes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TerminalEvent) -> Result<()> {
        match event.outcome {
            RunState::Succeeded => info!(
                run_id = %event.run_id,
                job = %event.job_id,
                window = %event.window,
                "{}",
                event.headline()
            ),
            _ => warn!(
                run_id = %event.run_id,
                job = %event.job_id,
                window = %event.window,
                error_id = event.error_id.as_deref().unwrap_or("-"),
                "{}",
                event.headline()
            ),
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: String,
    event: &'a TerminalEvent,
}

/// Posts outcomes as JSON to an HTTP endpoint
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TerminalEvent) -> Result<()> {
        let payload = WebhookPayload {
            text: event.headline(),
            event,
        };

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send webhook notification")?
            .error_for_status()
            .context("Webhook rejected notification")?;

        Ok(())
    }
}

/// Fans an event out to several notifiers; each failure is logged, the first is returned
#[derive(Clone, Default)]
pub struct MultiNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn notify(&self, event: &TerminalEvent) -> Result<()> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                warn!(run_id = %event.run_id, error = %e, "Notifier failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Notification settings (`settings.notifications`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Log every terminal outcome
    #[serde(default = "default_log")]
    pub log: bool,

    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
}

fn default_log() -> bool {
    true
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            log: default_log(),
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout() -> u64 {
    5_000
}

/// Build the notifier described by `settings`
pub fn build_notifier(settings: &NotificationSettings) -> Result<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if settings.log {
        notifiers.push(Arc::new(LogNotifier));
    }
    if let Some(webhook) = &settings.webhook {
        notifiers.push(Arc::new(WebhookNotifier::new(
            webhook.url.clone(),
            Duration::from_millis(webhook.timeout_ms),
        )?));
    }
    Ok(Arc::new(MultiNotifier::new(notifiers)))
}
