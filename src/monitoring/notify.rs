// src/monitoring/notify.rs
use crate::error::{MixerError, MixerResult};
use crate::monitoring::alerts::Alert;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// A delivery target. Rendering beyond a JSON payload is out of scope; each
/// provider posts to its HTTP endpoint.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn channel(&self) -> &str;

    async fn send(&self, alert: &Alert) -> MixerResult<()>;
}

fn alert_payload(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "id": alert.id,
        "type": alert.alert_type,
        "source": alert.source,
        "severity": format!("{:?}", alert.severity),
        "message": alert.message,
        "triggered_at": alert.triggered_at.to_rfc3339(),
    })
}

pub struct WebhookProvider {
    url: String,
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> MixerResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&alert_payload(alert))
            .send()
            .await
            .map_err(|e| MixerError::Transient(format!("webhook post: {e}")))?;
        if !response.status().is_success() {
            return Err(MixerError::Transient(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct SlackProvider {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackProvider {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationProvider for SlackProvider {
    fn channel(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> MixerResult<()> {
        let body = serde_json::json!({
            "text": format!(
                "[{:?}] {}/{}: {}",
                alert.severity, alert.alert_type, alert.source, alert.message
            ),
        });
        self.client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MixerError::Transient(format!("slack post: {e}")))?
            .error_for_status()
            .map_err(|e| MixerError::Transient(format!("slack status: {e}")))?;
        Ok(())
    }
}

pub struct TelegramProvider {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramProvider {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationProvider for TelegramProvider {
    fn channel(&self) -> &str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> MixerResult<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": format!(
                "[{:?}] {}: {}",
                alert.severity, alert.alert_type, alert.message
            ),
        });
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MixerError::Transient(format!("telegram post: {e}")))?
            .error_for_status()
            .map_err(|e| MixerError::Transient(format!("telegram status: {e}")))?;
        Ok(())
    }
}

/// Email rides an HTTP mail gateway; SMTP and message rendering stay outside
/// the core.
pub struct EmailProvider {
    gateway_url: String,
    recipient: String,
    client: reqwest::Client,
}

impl EmailProvider {
    pub fn new(gateway_url: String, recipient: String) -> Self {
        Self {
            gateway_url,
            recipient,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn channel(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> MixerResult<()> {
        let body = serde_json::json!({
            "to": self.recipient,
            "subject": format!("[{:?}] {}", alert.severity, alert.alert_type),
            "body": alert_payload(alert),
        });
        self.client
            .post(&self.gateway_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MixerError::Transient(format!("mail gateway: {e}")))?
            .error_for_status()
            .map_err(|e| MixerError::Transient(format!("mail status: {e}")))?;
        Ok(())
    }
}

/// Per-channel delivery counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub sent: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_response_ms: f64,
}

impl ChannelStats {
    pub fn average_response_ms(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.total_response_ms / self.sent as f64
        }
    }
}

/// Fans an alert out to every registered channel with bounded retries.
pub struct NotificationDispatcher {
    providers: Vec<Arc<dyn NotificationProvider>>,
    stats: Arc<RwLock<HashMap<String, ChannelStats>>>,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl NotificationDispatcher {
    pub fn new(max_retries: u32) -> Self {
        Self {
            providers: Vec::new(),
            stats: Arc::new(RwLock::new(HashMap::new())),
            max_retries,
            retry_base_delay_ms: 200,
        }
    }

    #[cfg(test)]
    pub fn with_base_delay(mut self, delay_ms: u64) -> Self {
        self.retry_base_delay_ms = delay_ms;
        self
    }

    pub fn register(&mut self, provider: Arc<dyn NotificationProvider>) {
        self.providers.push(provider);
    }

    pub fn channel_count(&self) -> usize {
        self.providers.len()
    }

    /// Delivers to every channel; failures on one channel never block the
    /// others.
    pub async fn dispatch(&self, alert: &Alert) {
        for provider in &self.providers {
            let channel = provider.channel().to_string();
            let started = Instant::now();
            let result = self.send_with_retries(provider.as_ref(), alert).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let mut stats = self.stats.write().await;
            let entry = stats.entry(channel.clone()).or_default();
            entry.sent += 1;
            entry.total_response_ms += elapsed_ms;
            match result {
                Ok(()) => entry.successful += 1,
                Err(e) => {
                    entry.failed += 1;
                    log::error!("notification via {channel} failed: {e}");
                }
            }
        }
    }

    async fn send_with_retries(
        &self,
        provider: &dyn NotificationProvider,
        alert: &Alert,
    ) -> MixerResult<()> {
        let mut attempt = 0;
        loop {
            match provider.send(alert).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    attempt += 1;
                    let delay = self.retry_base_delay_ms * (1 << attempt.min(8));
                    log::warn!(
                        "notification retry {attempt}/{} on {}: {e}",
                        self.max_retries,
                        provider.channel()
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn stats(&self) -> HashMap<String, ChannelStats> {
        self.stats.read().await.clone()
    }
}
