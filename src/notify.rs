//! Outcome notifications.
//!
//! Delivery is best-effort: a sink never returns an error to the caller,
//! and empty digests are never sent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AlertsConfig;
use crate::retry::RetryPolicy;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a finished digest. Must not fail or panic.
    async fn send(&self, digest: &str);
}

/// Sink used when no channel is configured.
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn send(&self, digest: &str) {
        debug!(chars = digest.chars().count(), "No notification channel configured");
    }
}

/// Posts digests to Telegram chats through the Bot API.
pub struct TelegramSink {
    http: Client,
    base_url: String,
    bot_token: SecretString,
    chat_ids: Vec<String>,
    max_message_len: usize,
    retry: RetryPolicy,
}

impl TelegramSink {
    pub fn new(
        bot_token: SecretString,
        chat_ids: Vec<String>,
        max_message_len: usize,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            http,
            base_url: TELEGRAM_API_URL.to_string(),
            bot_token,
            chat_ids,
            max_message_len: max_message_len.max(1),
            retry,
        })
    }

    /// Point the sink at another Bot API host (local relay, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build from the alerts config. `None` when the token or chat ids are unset.
    pub fn from_config(alerts: &AlertsConfig, retry: RetryPolicy) -> Result<Option<Self>> {
        let token = alerts
            .telegram_bot_token_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .filter(|t| !t.trim().is_empty());
        let chat_ids: Vec<String> = alerts
            .telegram_chat_ids_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .map(|ids| parse_chat_ids(&ids))
            .unwrap_or_default();

        match token {
            Some(token) if !chat_ids.is_empty() => Ok(Some(Self::new(
                SecretString::new(token),
                chat_ids,
                alerts.max_message_len,
                retry,
            )?)),
            _ => Ok(None),
        }
    }

    async fn post(&self, chat_id: &str, text: &str) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.base_url,
            self.bot_token.expose_secret()
        );
        let response = self
            .http
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .context("Telegram request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, digest: &str) {
        if digest.trim().is_empty() {
            return;
        }

        for chunk in split_message(digest, self.max_message_len) {
            for chat_id in &self.chat_ids {
                let sent = self
                    .retry
                    .run("telegram send", || self.post(chat_id, &chunk))
                    .await;
                if let Err(e) = sent {
                    warn!(chat_id = %chat_id, error = %e, "Failed to send Telegram message");
                }
            }
        }
    }
}

fn parse_chat_ids(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split `text` into chunks of at most `max_chars` characters.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
