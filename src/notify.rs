//! Announcement sinks. Fire-and-forget: callers log failures and move on.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::db::CompletedKey;
use crate::error::LedgerError;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> Result<(), LedgerError>;
}

/// Writes announcements to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, channel: &str, text: &str) -> Result<(), LedgerError> {
        info!(channel, text, "announcement");
        Ok(())
    }
}

/// Posts `{"content": text}` to a chat webhook. The channel is part of the
/// webhook URL, so `channel` only shows up in logs.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Internal(format!("webhook client build failed: {e}")))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, channel: &str, text: &str) -> Result<(), LedgerError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| LedgerError::Upstream(format!("webhook post to {channel} failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Upstream(format!("webhook returned {status}: {body}")));
        }
        Ok(())
    }
}

/// `"{name} +{level} {dungeon}"`, plus the whole-minute distance from par
/// when both times are known.
pub fn format_announcement(key: &CompletedKey) -> String {
    let base = format!("{} +{} {}", key.character, key.key_level, key.dungeon);
    if key.run_time_ms <= 0 || key.par_time_ms <= 0 {
        return base;
    }
    let diff = key.run_time_ms - key.par_time_ms;
    let sign = if diff < 0 { '-' } else { '+' };
    format!("{base} ({sign}{} min vs par)", diff.abs() / 60_000)
}
