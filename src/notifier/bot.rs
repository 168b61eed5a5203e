//! Per-user deal notifications over the Telegram HTTP API.
//!
//! All throttling state lives in Redis, scoped per chat: a 24 h message
//! counter, an over-cap cooldown flag and a 48 h product-seen set keyed by
//! md5 of the offer URL. The command surface of the bot is a separate
//! service; this module only pushes batches.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::models::DealItem;

const COUNTER_TTL_SECS: i64 = 24 * 3600;
const PRODUCT_SEEN_TTL_SECS: i64 = 48 * 3600;
const CHUNK_PAUSE_MS: u64 = 700;
pub const DEFAULT_CHUNK_SIZE: usize = 10;

pub struct Notifier {
    redis: ConnectionManager,
    http: Client,
    bot_token: String,
    daily_limit: i64,
}

impl Notifier {
    pub fn new(redis: ConnectionManager, bot_token: String, daily_limit: i64) -> Self {
        Self {
            redis,
            http: Client::new(),
            bot_token,
            daily_limit,
        }
    }

    /// Sends up to the chat's remaining daily budget from `items`, skipping
    /// products the chat has already seen. Returns the number of items sent.
    pub async fn send_batch(
        &self,
        chat_id: i64,
        items: &[DealItem],
        chunk_size: usize,
    ) -> Result<usize> {
        let mut redis = self.redis.clone();
        let user_key = format!("cooldown:user:{chat_id}");
        let count_key = format!("msgcount:{chat_id}");
        let product_key = format!("cooldown:product:{chat_id}");

        if redis.exists::<_, bool>(&user_key).await? {
            debug!(chat_id, "user on cooldown; skipping batch");
            return Ok(0);
        }
        let current: i64 = redis.get::<_, Option<i64>>(&count_key).await?.unwrap_or(0);
        if current >= self.daily_limit {
            redis
                .set_ex::<_, _, ()>(&user_key, 1, COUNTER_TTL_SECS as u64)
                .await?;
            return Ok(0);
        }
        let remaining = (self.daily_limit - current) as usize;

        let mut to_send: Vec<&DealItem> = Vec::new();
        for item in items {
            let pid = product_seen_key(&item.url);
            if redis.sismember::<_, _, bool>(&product_key, &pid).await? {
                continue;
            }
            redis.sadd::<_, _, ()>(&product_key, &pid).await?;
            redis
                .expire::<_, ()>(&product_key, PRODUCT_SEEN_TTL_SECS)
                .await?;
            to_send.push(item);
            if to_send.len() >= remaining {
                break;
            }
        }
        if to_send.is_empty() {
            return Ok(0);
        }

        let total: i64 = redis.incr(&count_key, to_send.len() as i64).await?;
        redis.expire::<_, ()>(&count_key, COUNTER_TTL_SECS).await?;
        if total >= self.daily_limit {
            redis
                .set_ex::<_, _, ()>(&user_key, 1, COUNTER_TTL_SECS as u64)
                .await?;
        }

        for (chunk_idx, chunk) in to_send.chunks(chunk_size.max(1)).enumerate() {
            let offset = chunk_idx * chunk_size.max(1);
            let text = format_chunk(chunk, offset);
            self.send_message(chat_id, &text, keyboard(chunk.len()))
                .await?;
            tokio::time::sleep(std::time::Duration::from_millis(CHUNK_PAUSE_MS)).await;
        }
        info!(chat_id, sent = to_send.len(), "deal batch delivered");
        Ok(to_send.len())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: serde_json::Value,
    ) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": reply_markup,
            "disable_web_page_preview": false,
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("telegram sendMessage")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, %body, "telegram rejected message");
            anyhow::bail!("telegram sendMessage {status}");
        }
        Ok(())
    }
}

/// md5 over the offer URL; the member key of the product-seen set.
pub fn product_seen_key(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Numbered plain-text block for one chunk. `offset` keeps numbering
/// continuous across chunks.
pub(crate) fn format_chunk(items: &[&DealItem], offset: usize) -> String {
    let mut lines = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let discount = item
            .discount_pct
            .map(|d| format!(" (−{d}%)"))
            .unwrap_or_default();
        lines.push(format!(
            "{}. {}\nЦена: {} ₽{}\nИсточник: {}\n{}\n",
            offset + idx + 1,
            item.title,
            item.price,
            discount,
            item.source,
            item.url,
        ));
    }
    lines.join("\n")
}

/// Inline keyboard: one `★ / Скрыть / Ещё −10%` row per item in the chunk.
pub(crate) fn keyboard(len: usize) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = (0..len)
        .map(|k| {
            serde_json::json!([
                { "text": "★", "callback_data": format!("fav:{k}") },
                { "text": "Скрыть", "callback_data": format!("hide:{k}") },
                { "text": "Ещё −10%", "callback_data": format!("more:{k}") },
            ])
        })
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Site;

    fn item(title: &str, price: i64, discount: Option<f64>) -> DealItem {
        DealItem {
            title: title.to_string(),
            url: format!("https://www.ozon.ru/product/{title}/"),
            price,
            discount_pct: discount,
            score: 50.0,
            source: Site::Ozon,
            img: None,
            fake_msrp: false,
        }
    }

    #[test]
    fn product_keys_are_stable_md5() {
        let a = product_seen_key("https://www.ozon.ru/product/x-1/");
        let b = product_seen_key("https://www.ozon.ru/product/x-1/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, product_seen_key("https://www.ozon.ru/product/x-2/"));
    }

    #[test]
    fn chunks_are_numbered_continuously() {
        let items = vec![item("a", 100, Some(25.0)), item("b", 200, None)];
        let refs: Vec<&DealItem> = items.iter().collect();
        let first = format_chunk(&refs, 0);
        assert!(first.starts_with("1. a"));
        assert!(first.contains("2. b"));
        assert!(first.contains("(−25%)"));
        let second = format_chunk(&refs[..1], 10);
        assert!(second.starts_with("11. a"));
    }

    #[test]
    fn keyboard_has_three_buttons_per_row() {
        let kb = keyboard(2);
        let rows = kb["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].as_array().unwrap().len(), 3);
        assert_eq!(rows[1][2]["callback_data"], "more:1");
    }
}
