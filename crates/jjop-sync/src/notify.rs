use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

/// Sink for one human-readable line per run. Never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, message: &str) {
        info!(message, "no webhook configured; notification only logged");
    }
}

/// Posts `{"content": message}` to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        let body = serde_json::json!({ "content": message });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => info!("notification sent"),
            Ok(resp) => warn!(status = resp.status().as_u16(), "webhook rejected notification"),
            Err(err) => error!(error = %err, "failed to send notification"),
        }
    }
}

pub fn notifier_for(webhook_url: Option<&str>) -> Box<dyn Notifier> {
    match webhook_url {
        Some(url) => match WebhookNotifier::new(url) {
            Ok(notifier) => Box::new(notifier),
            Err(err) => {
                warn!(error = %err, "webhook client unavailable; notifications disabled");
                Box::new(NoopNotifier)
            }
        },
        None => Box::new(NoopNotifier),
    }
}
