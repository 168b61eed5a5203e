//! Operational alerts: Slack webhook first, monitoring Telegram chat as the
//! fallback once Slack fails three times in a row.

use std::sync::atomic::{AtomicU32, Ordering};

use reqwest::Client;
use tracing::{debug, warn};

use crate::config::Settings;

const SLACK_FAILURE_FALLBACK: u32 = 3;

pub struct Monitoring {
    http: Client,
    slack_webhook: Option<String>,
    telegram_token: Option<String>,
    telegram_chat_id: Option<i64>,
    slack_failures: AtomicU32,
}

impl Monitoring {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            http: Client::new(),
            slack_webhook: settings.monitoring_slack_webhook.clone(),
            telegram_token: settings.monitoring_telegram_token.clone(),
            telegram_chat_id: settings.monitoring_telegram_chat_id,
            slack_failures: AtomicU32::new(0),
        }
    }

    /// No-op instance for tests and tooling.
    pub fn disabled() -> Self {
        Self {
            http: Client::new(),
            slack_webhook: None,
            telegram_token: None,
            telegram_chat_id: None,
            slack_failures: AtomicU32::new(0),
        }
    }

    /// Posts `text` to the monitoring channel. Never fails the caller: alert
    /// delivery problems are logged and counted only.
    pub async fn notify(&self, text: &str) {
        if let Some(webhook) = &self.slack_webhook {
            match self
                .http
                .post(webhook)
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    self.slack_failures.store(0, Ordering::Relaxed);
                    return;
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), "slack monitoring post rejected");
                }
                Err(err) => {
                    warn!(%err, "slack monitoring post failed");
                }
            }
            let failures = self.slack_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures < SLACK_FAILURE_FALLBACK {
                return;
            }
            debug!(failures, "falling back to monitoring telegram");
        }
        self.notify_telegram(text).await;
    }

    async fn notify_telegram(&self, text: &str) {
        let (Some(token), Some(chat_id)) = (&self.telegram_token, self.telegram_chat_id) else {
            return;
        };
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Err(err) = self.http.post(&url).json(&body).send().await {
            warn!(%err, "telegram monitoring post failed");
        }
    }
}
