//! Sharded Redis-stream work queue.
//!
//! One logical stream per `(site, geoid, category)` triple with a matching
//! consumer group, a mirrored `:dlq` stream, publish-side idempotency keys
//! (24 h) and a typed retry ladder: permanent failures (including HTTP
//! 4xx/5xx) go straight to the DLQ, everything else retries with exponential
//! backoff up to five attempts.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, gauge};
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::models::TaskPayload;
use crate::notifier::monitoring::Monitoring;

const IDEMPOTENCY_TTL_SECS: i64 = 24 * 3600;
const MAX_RETRIES: u32 = 5;
const BLOCK_MS: usize = 1_000;

/// Outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Same preset published within the idempotency window; dropped silently.
    Duplicate,
}

/// Narrow publish interface the orchestrator depends on.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, task: &TaskPayload) -> Result<PublishOutcome>;
}

/// Consumer shard pin. An empty pin consumes the unsharded base stream.
#[derive(Debug, Clone, Default)]
pub struct Shard {
    pub site: Option<String>,
    pub geoid: Option<String>,
    pub category: Option<String>,
}

impl Shard {
    pub fn is_pinned(&self) -> bool {
        self.site.is_some()
    }
}

#[derive(Clone)]
pub struct RedisQueue {
    redis: ConnectionManager,
    base_stream: String,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, base_stream: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("open redis")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("connect redis")?;
        Ok(Self {
            redis,
            base_stream: base_stream.to_string(),
        })
    }

    /// `<base>:<site>:<geoid|none>:<category|none>`; the bare base stream
    /// when no site is given.
    pub fn shard_stream(
        &self,
        site: Option<&str>,
        geoid: Option<&str>,
        category: Option<&str>,
    ) -> String {
        shard_stream_name(&self.base_stream, site, geoid, category)
    }

    fn task_stream(&self, task: &TaskPayload) -> String {
        self.shard_stream(
            Some(task.site.as_str()),
            task.geoid.as_deref(),
            task.category.as_deref(),
        )
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err).context("create consumer group"),
        }
    }

    /// Publishes a task. Fresh publishes (no retry counter) pass through the
    /// idempotency gate; retry and DLQ republishes bypass it, otherwise a
    /// retried task would be swallowed by its own key.
    pub async fn publish_task(
        &self,
        task: &TaskPayload,
        retries: Option<u32>,
        dlq: bool,
    ) -> Result<PublishOutcome> {
        let base = self.task_stream(task);
        let stream = if dlq { format!("{base}:dlq") } else { base };
        let group = format!("{stream}:group");
        self.ensure_group(&stream, &group).await?;

        let mut conn = self.redis.clone();
        if retries.is_none() {
            let idem_key = idempotency_key(task);
            let idem_redis_key = format!("{stream}:idem:{idem_key}");
            let added: bool = conn.set_nx(&idem_redis_key, 1).await?;
            if !added {
                debug!(key = %idem_key, "duplicate publish suppressed");
                return Ok(PublishOutcome::Duplicate);
            }
            conn.expire::<_, ()>(&idem_redis_key, IDEMPOTENCY_TTL_SECS).await?;
        }

        let data = serde_json::to_string(task).context("encode task payload")?;
        let mut fields: Vec<(String, String)> = vec![
            ("data".to_string(), data),
            ("idempotency_key".to_string(), idempotency_key(task)),
        ];
        if let Some(retries) = retries {
            fields.push(("retries".to_string(), retries.to_string()));
        }
        conn.xadd::<_, _, _, _, ()>(&stream, "*", &fields).await?;
        Ok(PublishOutcome::Published)
    }

    /// Blocking consume loop for one shard. Each message is acked and deleted
    /// before the next read, whatever the handler outcome.
    pub async fn consume<F, Fut>(&self, shard: &Shard, consumer: &str, handler: F) -> Result<()>
    where
        F: Fn(TaskPayload) -> Fut,
        Fut: Future<Output = Result<(), TaskError>>,
    {
        let stream = self.shard_stream(
            shard.site.as_deref(),
            shard.geoid.as_deref(),
            shard.category.as_deref(),
        );
        let group = format!("{stream}:group");
        self.ensure_group(&stream, &group).await?;
        info!(%stream, consumer, "consuming shard");

        loop {
            let Some((id, task, retries)) = self.read_one(&stream, &group, consumer).await? else {
                continue;
            };

            match handler(task.clone()).await {
                Ok(()) => {}
                Err(err) if err.is_permanent() => {
                    warn!(%err, url = %task.url, "permanent failure; dead-lettering");
                    self.republish(&task, Some(retries), true).await;
                }
                Err(err) => {
                    if retries + 1 >= MAX_RETRIES {
                        warn!(%err, url = %task.url, retries, "retries exhausted; dead-lettering");
                        self.republish(&task, Some(retries + 1), true).await;
                    } else {
                        let delay = backoff_delay(retries);
                        debug!(%err, url = %task.url, retries, ?delay, "retrying task");
                        tokio::time::sleep(delay).await;
                        self.republish(&task, Some(retries + 1), false).await;
                    }
                }
            }
            // The original id is settled whatever the outcome above.
            self.ack_delete(&stream, &group, &id).await;
        }
    }

    /// DLQ consumer: counts processed tasks and keeps the backlog gauge
    /// current, alerting when the backlog crosses the overflow threshold.
    pub async fn consume_dlq<F, Fut>(
        &self,
        shard: &Shard,
        consumer: &str,
        overflow_threshold: i64,
        monitoring: &Monitoring,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(TaskPayload) -> Fut,
        Fut: Future<Output = Result<(), TaskError>>,
    {
        let base = self.shard_stream(
            shard.site.as_deref(),
            shard.geoid.as_deref(),
            shard.category.as_deref(),
        );
        let stream = format!("{base}:dlq");
        let group = format!("{stream}:group");
        self.ensure_group(&stream, &group).await?;
        info!(%stream, consumer, "consuming dead-letter shard");

        loop {
            let read = self.read_one(&stream, &group, consumer).await?;
            match read {
                Some((id, task, _retries)) => {
                    let outcome = handler(task).await;
                    if let Err(err) = outcome {
                        warn!(%err, "dlq handler failed");
                    }
                    counter!("dlq_tasks_total", 1);
                    self.ack_delete(&stream, &group, &id).await;
                }
                None => {}
            }
            self.report_backlog(&stream, overflow_threshold, monitoring)
                .await;
        }
    }

    async fn report_backlog(&self, dlq_stream: &str, threshold: i64, monitoring: &Monitoring) {
        let mut conn = self.redis.clone();
        let backlog: i64 = match conn.xlen(dlq_stream).await {
            Ok(len) => len,
            Err(err) => {
                warn!(%err, "xlen on dlq failed");
                return;
            }
        };
        gauge!("dlq_backlog", backlog as f64);
        if backlog > threshold {
            monitoring
                .notify(&format!("DLQ overflow: {backlog} messages on {dlq_stream}"))
                .await;
        }
    }

    /// One blocking group read. `None` on idle poll.
    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<(String, TaskPayload, u32)>> {
        let mut conn = self.redis.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(BLOCK_MS);
        let reply: StreamReadReply = match conn.xread_options(&[stream], &[">"], &opts).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, %stream, "stream read failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Ok(None);
            }
        };

        for key in reply.keys {
            for entry in key.ids {
                let data: Option<String> = entry
                    .map
                    .get("data")
                    .and_then(|v| redis::from_redis_value(v).ok());
                let retries: u32 = entry
                    .map
                    .get("retries")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);

                let Some(data) = data else {
                    warn!(id = %entry.id, "stream entry without data field; dropping");
                    self.ack_delete(stream, group, &entry.id).await;
                    continue;
                };
                match serde_json::from_str::<TaskPayload>(&data) {
                    Ok(task) => return Ok(Some((entry.id, task, retries))),
                    Err(err) => {
                        warn!(%err, id = %entry.id, "undecodable task payload; dropping");
                        self.ack_delete(stream, group, &entry.id).await;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn republish(&self, task: &TaskPayload, retries: Option<u32>, dlq: bool) {
        if let Err(err) = self.publish_task(task, retries, dlq).await {
            warn!(%err, url = %task.url, dlq, "republish failed");
        }
    }

    async fn ack_delete(&self, stream: &str, group: &str, id: &str) {
        let mut conn = self.redis.clone();
        if let Err(err) = conn.xack::<_, _, _, ()>(stream, group, &[id]).await {
            warn!(%err, id, "xack failed");
        }
        if let Err(err) = conn.xdel::<_, _, ()>(stream, &[id]).await {
            warn!(%err, id, "xdel failed");
        }
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn publish(&self, task: &TaskPayload) -> Result<PublishOutcome> {
        self.publish_task(task, None, false).await
    }
}

/// Stream name for one shard.
pub fn shard_stream_name(
    base: &str,
    site: Option<&str>,
    geoid: Option<&str>,
    category: Option<&str>,
) -> String {
    match site {
        Some(site) => format!(
            "{base}:{site}:{}:{}",
            geoid.unwrap_or("none"),
            category.unwrap_or("none"),
        ),
        None => base.to_string(),
    }
}

/// `site:geoid:category:url_template:page`, with the plain URL standing in
/// for a missing template and page 0 for single-page presets.
pub fn idempotency_key(task: &TaskPayload) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        task.site,
        task.geoid.as_deref().unwrap_or("none"),
        task.category.as_deref().unwrap_or("none"),
        task.url_template.as_deref().unwrap_or(&task.url),
        task.page.unwrap_or(0),
    )
}

fn backoff_delay(retries: u32) -> Duration {
    let base = 2u64.saturating_pow(retries);
    Duration::from_secs_f64(base as f64 + rand::thread_rng().gen_range(0.0..1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Site;

    #[test]
    fn shard_names_encode_site_geoid_category() {
        assert_eq!(
            shard_stream_name("presets", Some("ozon"), Some("213"), Some("phones")),
            "presets:ozon:213:phones"
        );
        assert_eq!(
            shard_stream_name("presets", Some("ozon"), None, None),
            "presets:ozon:none:none"
        );
        assert_eq!(shard_stream_name("presets", None, None, None), "presets");
    }

    #[test]
    fn idempotency_key_prefers_the_template() {
        let mut task = TaskPayload::new(Site::Ozon, "https://www.ozon.ru/category/x/?page=2");
        task.geoid = Some("213".into());
        task.category = Some("phones".into());
        assert_eq!(
            idempotency_key(&task),
            "ozon:213:phones:https://www.ozon.ru/category/x/?page=2:0"
        );

        task.url_template = Some("https://www.ozon.ru/category/x/?page={page}".into());
        task.page = Some(2);
        assert_eq!(
            idempotency_key(&task),
            "ozon:213:phones:https://www.ozon.ru/category/x/?page={page}:2"
        );
    }

    #[test]
    fn equal_presets_share_an_idempotency_key() {
        let mut a = TaskPayload::new(Site::Ozon, "https://www.ozon.ru/category/x/");
        a.geoid = Some("213".into());
        a.category = Some("phones".into());
        let mut b = a.clone();
        b.notify = true;
        b.min_discount = 99;
        // Thresholds and notify do not participate in the key.
        assert_eq!(idempotency_key(&a), idempotency_key(&b));
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        for retries in 0..5 {
            let delay = backoff_delay(retries).as_secs_f64();
            let base = 2f64.powi(retries as i32);
            assert!(delay >= base && delay < base + 1.0, "retries={retries} delay={delay}");
        }
    }
}
