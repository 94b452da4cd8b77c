//! Minimal Telegram Bot API client: long-poll `getUpdates` for inbound
//! messages, `sendMessage` for outbound delivery.

use anyhow::{Context, Result};
use std::time::Duration;

pub struct TelegramApi {
    base_url: String,
    client: reqwest::Client,
}

/// One inbound message extracted from a `getUpdates` response.
#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    pub text: Option<String>,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(format!("https://api.telegram.org/bot{bot_token}"))
    }

    pub(crate) fn with_base_url(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("sendMessage request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
            anyhow::bail!("Telegram sendMessage failed ({status}): {err}");
        }

        Ok(())
    }

    /// Long-poll for updates past `offset`. Blocks up to `timeout_secs`
    /// server-side; the request itself is capped slightly above that.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });

        let resp = self
            .client
            .post(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs + 10))
            .json(&body)
            .send()
            .await
            .context("getUpdates request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Telegram getUpdates failed ({})", resp.status());
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .context("getUpdates response was not valid JSON")?;

        Ok(parse_updates(&data))
    }

    pub async fn health_check(&self) -> bool {
        self.client
            .get(self.method_url("getMe"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

fn parse_updates(data: &serde_json::Value) -> Vec<Update> {
    let Some(results) = data.get("result").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|update| {
            let update_id = update.get("update_id").and_then(serde_json::Value::as_i64)?;
            let message = update.get("message")?;
            let chat_id = message
                .get("chat")
                .and_then(|c| c.get("id"))
                .and_then(serde_json::Value::as_i64)?;
            let text = message
                .get("text")
                .and_then(|t| t.as_str())
                .map(ToString::to_string);
            Some(Update {
                update_id,
                chat_id,
                text,
            })
        })
        .collect()
}
