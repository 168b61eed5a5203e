//! Process configuration: environment settings, category presets and the
//! geoid→city region map.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Application configuration, loaded once per process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_url: String,
    pub redis_url: String,
    pub queue_stream: String,

    /// Per-domain render concurrency.
    pub scrape_concurrency: usize,
    /// Browser contexts pre-created in the render pool.
    pub render_contexts: usize,

    pub default_geoid: String,
    pub min_discount: i64,
    pub min_score: i64,
    pub daily_msg_limit: i64,
    pub shipping_cost: i64,

    pub budget_max_pages: u32,
    pub budget_max_tasks: u32,
    /// UTC hours `(start, end)`; spans midnight when start > end.
    pub quiet_hours: Option<(u32, u32)>,

    pub presets_file: String,
    pub selectors_file: String,

    pub s3_bucket: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub snapshot_ttl_days: i64,

    pub dlq_overflow_threshold: i64,

    /// Comma-separated urlsafe-base64 AES-256 keys; first is active.
    pub data_encryption_key: Option<String>,

    pub telegram_bot_token: Option<String>,
    pub tg_chat_id: Option<i64>,
    pub monitoring_slack_webhook: Option<String>,
    pub monitoring_telegram_token: Option<String>,
    pub monitoring_telegram_chat_id: Option<i64>,

    pub metrics_port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            db_url: env_or("DB_URL", "./deals.db"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            queue_stream: env_or("QUEUE_STREAM", "presets"),
            scrape_concurrency: env_parse("SCRAPE_CONCURRENCY", 2),
            render_contexts: env_parse("RENDER_CONTEXTS", 4),
            default_geoid: env_or("DEFAULT_GEOID", "213"),
            min_discount: env_parse("MIN_DISCOUNT", 25),
            min_score: env_parse("MIN_SCORE", 70),
            daily_msg_limit: env_parse("DAILY_MSG_LIMIT", 20),
            shipping_cost: env_parse("SHIPPING_COST", 199),
            budget_max_pages: env_parse("BUDGET_MAX_PAGES", 100),
            budget_max_tasks: env_parse("BUDGET_MAX_TASKS", 20),
            quiet_hours: env_opt("QUIET_HOURS").and_then(|v| parse_quiet_hours(&v)),
            presets_file: env_or("PRESETS_FILE", "./presets.yaml"),
            selectors_file: env_or("SELECTORS_FILE", "./selectors.yaml"),
            s3_bucket: env_opt("S3_BUCKET"),
            s3_endpoint: env_opt("S3_ENDPOINT"),
            s3_region: env_or("S3_REGION", "us-east-1"),
            s3_access_key: env_opt("S3_ACCESS_KEY"),
            s3_secret_key: env_opt("S3_SECRET_KEY"),
            snapshot_ttl_days: env_parse("SNAPSHOT_TTL_DAYS", 7),
            dlq_overflow_threshold: env_parse("DLQ_OVERFLOW_THRESHOLD", 100),
            data_encryption_key: env_opt("DATA_ENCRYPTION_KEY"),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            tg_chat_id: env_opt("TG_CHAT_ID").and_then(|v| v.parse().ok()),
            monitoring_slack_webhook: env_opt("MONITORING_SLACK_WEBHOOK"),
            monitoring_telegram_token: env_opt("MONITORING_TELEGRAM_TOKEN"),
            monitoring_telegram_chat_id: env_opt("MONITORING_TELEGRAM_CHAT_ID")
                .and_then(|v| v.parse().ok()),
            metrics_port: env_parse("METRICS_PORT", 8000),
        }
    }

    /// SQLite path from `DB_URL`; tolerates a `sqlite://` scheme prefix.
    pub fn db_path(&self) -> &str {
        self.db_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.db_url)
    }
}

/// Parses `"HH-HH"` into a `(start, end)` hour pair. Spanning midnight
/// (start > end) is allowed.
pub fn parse_quiet_hours(raw: &str) -> Option<(u32, u32)> {
    let (start, end) = raw.trim().split_once('-')?;
    let start: u32 = start.trim().parse().ok()?;
    let end: u32 = end.trim().parse().ok()?;
    if start > 23 || end > 23 {
        warn!(raw, "ignoring QUIET_HOURS outside 0..24");
        return None;
    }
    Some((start, end))
}

/// One category preset: `name` is `<category>:<label>`, `url` the listing.
#[derive(Debug, Clone, Deserialize)]
pub struct PresetItem {
    pub name: String,
    pub url: String,
}

impl PresetItem {
    pub fn category(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }
}

/// Category presets fanned out by the orchestrator, keyed by site name.
#[derive(Debug, Clone, Deserialize)]
pub struct Presets {
    #[serde(default = "default_geoid")]
    pub geoid_default: String,
    pub sites: HashMap<String, Vec<PresetItem>>,
}

fn default_geoid() -> String {
    "213".to_string()
}

impl Presets {
    /// All distinct preset categories, in stable order.
    pub fn categories(&self) -> Vec<String> {
        let mut seen = Vec::new();
        let mut sites: Vec<&String> = self.sites.keys().collect();
        sites.sort();
        for site in sites {
            for item in &self.sites[site] {
                let cat = item.category().to_string();
                if !seen.contains(&cat) {
                    seen.push(cat);
                }
            }
        }
        seen
    }
}

pub fn load_presets(path: impl AsRef<Path>) -> Result<Presets> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read presets file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse presets file {}", path.display()))
}

/// Region map used by `ensure_region`: geoid → displayed city name.
/// `GEOID_CITY_MAP` may carry a JSON object extending the built-ins.
pub fn region_map() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("213".to_string(), "Москва".to_string());
    map.insert("2".to_string(), "Санкт-Петербург".to_string());
    if let Some(extra) = env_opt("GEOID_CITY_MAP") {
        match serde_json::from_str::<HashMap<String, String>>(&extra) {
            Ok(overrides) => map.extend(overrides),
            Err(err) => warn!(%err, "ignoring malformed GEOID_CITY_MAP"),
        }
    }
    map
}
