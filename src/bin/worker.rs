//! Shard worker process: render pool + pipeline + notifier behind one queue
//! consumer, optionally pinned to a `(site, geoid, category)` shard.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use dealbot_backend::config::{region_map, Settings};
use dealbot_backend::crypto::KeyRing;
use dealbot_backend::notifier::{Monitoring, Notifier};
use dealbot_backend::observability::{self, CategoryStats, ListingStats};
use dealbot_backend::processing::Pipeline;
use dealbot_backend::queue::{RedisQueue, Shard};
use dealbot_backend::scrapers::{AdapterRegistry, RenderPool, SelectorRegistry};
use dealbot_backend::storage::{SnapshotStore, Store};
use dealbot_backend::worker::Worker;

#[derive(Debug, Parser)]
#[command(name = "dealbot-worker", about = "Shard worker for the deal pipeline")]
struct Args {
    /// Shard pin: site (ozon|market).
    #[arg(long, env = "WORKER_SITE")]
    site: Option<String>,
    /// Shard pin: geoid.
    #[arg(long, env = "WORKER_GEOID")]
    geoid: Option<String>,
    /// Shard pin: category.
    #[arg(long, env = "WORKER_CATEGORY")]
    category: Option<String>,
    /// Consumer name inside the group.
    #[arg(long, env = "WORKER_CONSUMER", default_value = "worker-1")]
    consumer: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env();
    observability::logging::init();
    observability::metrics::install_exporter(settings.metrics_port)?;

    let crypto = match settings.data_encryption_key.as_deref() {
        Some(spec) => Some(KeyRing::from_spec(spec).context("parse DATA_ENCRYPTION_KEY")?),
        None => {
            warn!("DATA_ENCRYPTION_KEY not set; user fields are stored in plaintext");
            None
        }
    };
    let store = Store::open(settings.db_path(), crypto).context("open store")?;

    let selectors = SelectorRegistry::load(&settings.selectors_file)
        .unwrap_or_else(|err| {
            warn!(%err, "selectors file missing or invalid; using built-in defaults");
            SelectorRegistry::default()
        });
    let adapters = Arc::new(AdapterRegistry::new(selectors, region_map()));

    let snapshots = SnapshotStore::from_settings(&settings)?;
    let render = Arc::new(RenderPool::start(&settings, snapshots.clone()).await?);

    let queue = RedisQueue::connect(&settings.redis_url, &settings.queue_stream).await?;

    let notifier = match settings.telegram_bot_token.clone() {
        Some(token) => {
            let client = redis::Client::open(settings.redis_url.as_str())?;
            let redis = redis::aio::ConnectionManager::new(client).await?;
            Some(Arc::new(Notifier::new(
                redis,
                token,
                settings.daily_msg_limit,
            )))
        }
        None => None,
    };

    let pipeline = Arc::new(Pipeline {
        store: store.clone(),
        render: render.clone(),
        adapters,
        snapshots,
        monitoring: Arc::new(Monitoring::from_settings(&settings)),
        listing_stats: Arc::new(ListingStats::new()),
        category_stats: Arc::new(CategoryStats::new()),
        shipping_cost: settings.shipping_cost,
        default_geoid: settings.default_geoid.clone(),
    });

    let shard = Shard {
        site: args.site,
        geoid: args.geoid,
        category: args.category,
    };
    let worker = Worker::new(
        queue,
        pipeline,
        store,
        notifier,
        settings.tg_chat_id,
        shard,
        args.consumer,
    );

    info!("worker up");
    tokio::select! {
        result = worker.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    render.stop().await;
    Ok(())
}
