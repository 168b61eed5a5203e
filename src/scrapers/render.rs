//! Headless-browser render pool.
//!
//! One long-lived Chrome instance with a fixed pool of isolated browser
//! contexts, per-domain semaphores for politeness, a Redis-backed HTML cache
//! with conditional revalidation (ETag / If-Modified-Since) and HTML+PNG
//! snapshots of failed pages. The pool has an explicit `start`/`stop`
//! lifecycle; nothing is initialized implicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as AnyhowContext, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, CookieParam, EventResponseReceived, Headers, ResourceType,
    SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::storage::ClearDataForOriginParams;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures_util::StreamExt;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::Settings;
use crate::error::TaskError;
use crate::scrapers::adapters::Cookie;
use crate::scrapers::robots::RobotsCache;
use crate::storage::{SnapshotStore, PREFIX_ERRORS};

pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

const META_TTL_SECS: u64 = 24 * 3600;
const CACHE_TTL_MIN: u64 = 30;
const CACHE_TTL_MAX: u64 = 180;
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Per-fetch knobs; the defaults match a category listing fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub cookies: Vec<Cookie>,
    pub wait_selector: Option<String>,
    pub extra_headers: HashMap<String, String>,
    pub region_hint: Option<String>,
    pub timeout_ms: u64,
    pub sleep_ms: u64,
    pub sleep_jitter_ms: u64,
    pub cache_ttl: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cookies: Vec::new(),
            wait_selector: None,
            extra_headers: HashMap::new(),
            region_hint: None,
            timeout_ms: 60_000,
            sleep_ms: 2_000,
            sleep_jitter_ms: 1_000,
            cache_ttl: None,
            etag: None,
            last_modified: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub html: String,
    pub screenshot: Vec<u8>,
    pub from_cache: bool,
}

/// Conditional-request metadata kept alongside the cache for 24 h.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RenderMeta {
    html: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

pub struct RenderPool {
    browser: Arc<AsyncMutex<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    ctx_permits: Arc<Semaphore>,
    ctx_pool: Arc<Mutex<Vec<BrowserContextId>>>,
    domain_sems: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_domain: usize,
    domain_errors: Mutex<HashMap<String, u32>>,
    redis: ConnectionManager,
    snapshots: SnapshotStore,
    robots: RobotsCache,
}

impl RenderPool {
    /// Launches the browser and pre-creates the context pool.
    pub async fn start(settings: &Settings, snapshots: SnapshotStore) -> Result<Self> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1366, 860)
            .arg(format!("--user-agent={DEFAULT_UA}"))
            .build()
            .map_err(|e| anyhow!("browser config: {e}"))?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .context("launch headless browser")?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(%err, "browser handler event error");
                }
            }
        });

        let mut contexts = Vec::with_capacity(settings.render_contexts);
        for _ in 0..settings.render_contexts {
            let ctx = browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await
                .context("create browser context")?;
            contexts.push(ctx);
        }

        let client = redis::Client::open(settings.redis_url.as_str()).context("open redis")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("connect redis")?;

        let http = reqwest::Client::builder()
            .user_agent(DEFAULT_UA)
            .timeout(Duration::from_secs(10))
            .build()
            .context("build robots http client")?;

        Ok(Self {
            browser: Arc::new(AsyncMutex::new(browser)),
            handler: Mutex::new(Some(handler_task)),
            ctx_permits: Arc::new(Semaphore::new(settings.render_contexts)),
            ctx_pool: Arc::new(Mutex::new(contexts)),
            domain_sems: Mutex::new(HashMap::new()),
            per_domain: settings.scrape_concurrency.max(1),
            domain_errors: Mutex::new(HashMap::new()),
            redis,
            snapshots,
            robots: RobotsCache::new(http, DEFAULT_UA.to_string()),
        })
    }

    /// Closes the browser and stops the event handler.
    pub async fn stop(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(err) = browser.close().await {
            warn!(%err, "browser close failed");
        }
        let _ = browser.wait().await;
        if let Some(task) = self.handler.lock().take() {
            task.abort();
        }
    }

    fn domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        self.domain_sems
            .lock()
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain)))
            .clone()
    }

    /// Renders `url` and returns its HTML plus a full-page screenshot.
    ///
    /// Cache hits and 304 revalidations return an empty screenshot. Failures
    /// are snapshotted, counted per domain and re-raised.
    pub async fn fetch(&self, url: &str, opts: FetchOptions) -> Result<FetchResult, TaskError> {
        if !self.robots.allowed(url).await {
            return Err(TaskError::RobotsDisallowed(url.to_string()));
        }

        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let cache_key = format!("render:{url}");
        let meta_key = format!("{cache_key}:meta");

        let mut redis = self.redis.clone();
        if let Ok(Some(html)) = redis.get::<_, Option<String>>(&cache_key).await {
            return Ok(FetchResult {
                html,
                screenshot: Vec::new(),
                from_cache: true,
            });
        }
        let mut meta = RenderMeta::default();
        if let Ok(Some(raw)) = redis.get::<_, Option<String>>(&meta_key).await {
            match serde_json::from_str::<RenderMeta>(&raw) {
                Ok(parsed) => meta = parsed,
                Err(err) => debug!(%err, "discarding malformed render meta"),
            }
        }
        let mut opts = opts;
        if opts.etag.is_none() {
            opts.etag = meta.etag.clone();
        }
        if opts.last_modified.is_none() {
            opts.last_modified = meta.last_modified.clone();
        }

        let sem = self.domain_semaphore(&domain);
        let _domain_permit = sem
            .acquire_owned()
            .await
            .map_err(|_| TaskError::permanent("render pool stopped"))?;
        let _ctx_permit = self
            .ctx_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskError::permanent("render pool stopped"))?;
        let ctx = self
            .ctx_pool
            .lock()
            .pop()
            .expect("context pool in sync with permits");

        let started = Instant::now();
        let result = self
            .fetch_in_context(&ctx, &domain, url, &opts, &cache_key, &meta_key, &meta)
            .await;
        self.ctx_pool.lock().push(ctx);

        histogram!(
            "render_latency_seconds",
            started.elapsed().as_secs_f64(),
            "domain" => domain.clone()
        );
        match &result {
            Ok(_) => {
                self.domain_errors.lock().remove(&domain);
            }
            Err(_) => {
                counter!("render_errors_total", 1, "domain" => domain.clone());
                *self.domain_errors.lock().entry(domain).or_insert(0) += 1;
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_in_context(
        &self,
        ctx: &BrowserContextId,
        domain: &str,
        url: &str,
        opts: &FetchOptions,
        cache_key: &str,
        meta_key: &str,
        meta: &RenderMeta,
    ) -> Result<FetchResult, TaskError> {
        // Advisory backoff: a struggling domain earns itself extra delay.
        let err_count = self.domain_errors.lock().get(domain).copied().unwrap_or(0);
        if err_count > 0 {
            tokio::time::sleep(Duration::from_secs(err_count.min(10) as u64)).await;
        }

        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(ctx.clone())
            .build()
            .map_err(|e| TaskError::Other(anyhow!("target params: {e}")))?;
        let page = self
            .browser
            .lock()
            .await
            .new_page(params)
            .await
            .map_err(|e| TaskError::Other(anyhow!("new page: {e}")))?;

        let outcome = self
            .drive_page(&page, domain, url, opts, cache_key, meta_key, meta)
            .await;

        if outcome.is_err() {
            let html = page.content().await.unwrap_or_default();
            let screenshot = page
                .screenshot(screenshot_params())
                .await
                .unwrap_or_default();
            self.snapshots
                .save(PREFIX_ERRORS, url, &html, &screenshot)
                .await;
        }

        // Single-use contexts: always clear cookies and storage before the
        // context goes back to the pool.
        let _ = page.execute(ClearBrowserCookiesParams::default()).await;
        let _ = page
            .execute(ClearDataForOriginParams::new("*", "all"))
            .await;
        let _ = page.close().await;

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_page(
        &self,
        page: &Page,
        domain: &str,
        url: &str,
        opts: &FetchOptions,
        cache_key: &str,
        meta_key: &str,
        meta: &RenderMeta,
    ) -> Result<FetchResult, TaskError> {
        let mut headers = opts.extra_headers.clone();
        if let Some(etag) = &opts.etag {
            headers.insert("If-None-Match".to_string(), etag.clone());
        }
        if let Some(lm) = &opts.last_modified {
            headers.insert("If-Modified-Since".to_string(), lm.clone());
        }
        if !headers.is_empty() {
            let json = serde_json::to_value(&headers)
                .map_err(|e| TaskError::Other(anyhow!("encode headers: {e}")))?;
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(json)))
                .await
                .map_err(|e| TaskError::Other(anyhow!("set headers: {e}")))?;
        }

        let mut cookies = opts.cookies.clone();
        if let Some(region) = &opts.region_hint {
            cookies.push(Cookie::new("region", region, &format!(".{domain}")));
        }
        if !cookies.is_empty() {
            let params = cookies
                .iter()
                .map(cookie_param)
                .collect::<Result<Vec<_>, _>>()?;
            page.set_cookies(params)
                .await
                .map_err(|e| TaskError::Other(anyhow!("set cookies: {e}")))?;
        }

        // Watch for the main-document response to learn status + validators.
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| TaskError::Other(anyhow!("response listener: {e}")))?;
        let main_doc: Arc<Mutex<Option<(i64, Option<String>, Option<String>)>>> =
            Arc::new(Mutex::new(None));
        let collector = {
            let main_doc = main_doc.clone();
            tokio::spawn(async move {
                while let Some(event) = responses.next().await {
                    if matches!(event.r#type, ResourceType::Document) {
                        let headers = serde_json::to_value(&event.response.headers)
                            .unwrap_or_default();
                        let etag = header_value(&headers, "etag");
                        let last_modified = header_value(&headers, "last-modified");
                        *main_doc.lock() = Some((event.response.status, etag, last_modified));
                        break;
                    }
                }
            })
        };

        let navigation = tokio::time::timeout(
            Duration::from_millis(opts.timeout_ms),
            page.goto(url),
        )
        .await;
        match navigation {
            Err(_) => {
                collector.abort();
                return Err(TaskError::RenderTimeout {
                    url: url.to_string(),
                    timeout_ms: opts.timeout_ms,
                });
            }
            Ok(Err(err)) => {
                collector.abort();
                return Err(TaskError::Other(anyhow!("goto {url}: {err}")));
            }
            Ok(Ok(_)) => {}
        }

        if let Some(selector) = &opts.wait_selector {
            let deadline = Instant::now() + Duration::from_millis(opts.timeout_ms / 2);
            loop {
                if page.find_element(selector.as_str()).await.is_ok() {
                    break;
                }
                if Instant::now() >= deadline {
                    collector.abort();
                    return Err(TaskError::RenderTimeout {
                        url: url.to_string(),
                        timeout_ms: opts.timeout_ms / 2,
                    });
                }
                tokio::time::sleep(SELECTOR_POLL).await;
            }
        }

        // Jittered politeness pause before touching the page content.
        let jitter = if opts.sleep_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=opts.sleep_jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(Duration::from_millis(opts.sleep_ms + jitter)).await;

        collector.abort();
        let (status, resp_etag, resp_last_modified) =
            main_doc.lock().take().unwrap_or((200, None, None));

        let cache_ttl = opts
            .cache_ttl
            .unwrap_or_else(|| rand::thread_rng().gen_range(CACHE_TTL_MIN..=CACHE_TTL_MAX));
        let mut redis = self.redis.clone();

        if status == 304 && !meta.html.is_empty() {
            debug!(%url, "not modified; serving revalidated cache");
            let _: Result<(), _> = redis.set_ex(cache_key, &meta.html, cache_ttl).await;
            return Ok(FetchResult {
                html: meta.html.clone(),
                screenshot: Vec::new(),
                from_cache: true,
            });
        }
        if (400..600).contains(&status) {
            return Err(TaskError::Http {
                status: status as u16,
                url: url.to_string(),
            });
        }

        let html = page
            .content()
            .await
            .map_err(|e| TaskError::Other(anyhow!("page content: {e}")))?;
        let screenshot = page
            .screenshot(screenshot_params())
            .await
            .map_err(|e| TaskError::Other(anyhow!("screenshot: {e}")))?;

        if let Err(err) = redis.set_ex::<_, _, ()>(cache_key, &html, cache_ttl).await {
            debug!(%err, "html cache write failed");
        }
        let new_meta = RenderMeta {
            html: html.clone(),
            etag: resp_etag,
            last_modified: resp_last_modified,
        };
        match serde_json::to_string(&new_meta) {
            Ok(raw) => {
                if let Err(err) = redis.set_ex::<_, _, ()>(meta_key, raw, META_TTL_SECS).await {
                    debug!(%err, "render meta write failed");
                }
            }
            Err(err) => debug!(%err, "render meta encode failed"),
        }

        Ok(FetchResult {
            html,
            screenshot,
            from_cache: false,
        })
    }
}

fn screenshot_params() -> ScreenshotParams {
    ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Png)
        .full_page(true)
        .build()
}

fn cookie_param(cookie: &Cookie) -> Result<CookieParam, TaskError> {
    CookieParam::builder()
        .name(&cookie.name)
        .value(&cookie.value)
        .domain(&cookie.domain)
        .path(&cookie.path)
        .build()
        .map_err(|e| TaskError::Other(anyhow!("cookie param: {e}")))
}

fn header_value(headers: &serde_json::Value, name: &str) -> Option<String> {
    let object = headers.as_object()?;
    object
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_str().map(|s| s.to_string()))
}
