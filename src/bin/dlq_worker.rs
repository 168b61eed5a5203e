//! Dead-letter consumer: drains poisoned tasks, keeps the backlog gauge
//! current and alerts when the backlog crosses the overflow threshold.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dealbot_backend::config::Settings;
use dealbot_backend::notifier::Monitoring;
use dealbot_backend::observability;
use dealbot_backend::queue::{RedisQueue, Shard};

#[derive(Debug, Parser)]
#[command(name = "dealbot-dlq", about = "Dead-letter consumer")]
struct Args {
    #[arg(long, env = "WORKER_SITE")]
    site: Option<String>,
    #[arg(long, env = "WORKER_GEOID")]
    geoid: Option<String>,
    #[arg(long, env = "WORKER_CATEGORY")]
    category: Option<String>,
    #[arg(long, env = "WORKER_CONSUMER", default_value = "dlq-1")]
    consumer: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_env();
    observability::logging::init();
    observability::metrics::install_exporter(settings.metrics_port)?;

    let queue = RedisQueue::connect(&settings.redis_url, &settings.queue_stream)
        .await
        .context("connect queue")?;
    let monitoring = Monitoring::from_settings(&settings);
    let shard = Shard {
        site: args.site,
        geoid: args.geoid,
        category: args.category,
    };

    info!("dlq worker up");
    tokio::select! {
        result = queue.consume_dlq(
            &shard,
            &args.consumer,
            settings.dlq_overflow_threshold,
            &monitoring,
            |task| async move {
                info!(url = %task.url, site = %task.site, "dead-lettered task");
                Ok(())
            },
        ) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
