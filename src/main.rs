//! Orchestrator process: loads presets, schedules the digest and silent runs
//! and fans tasks into the sharded work queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use dealbot_backend::config::{load_presets, Settings};
use dealbot_backend::crypto::KeyRing;
use dealbot_backend::observability;
use dealbot_backend::orchestrator::Orchestrator;
use dealbot_backend::queue::RedisQueue;
use dealbot_backend::storage::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env();
    observability::logging::init();
    observability::metrics::install_exporter(settings.metrics_port)?;

    let crypto = build_keyring(&settings)?;
    let store = Store::open(settings.db_path(), crypto).context("open store")?;
    let presets = load_presets(&settings.presets_file)?;
    let queue = RedisQueue::connect(&settings.redis_url, &settings.queue_stream).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(queue),
        store,
        presets,
        &settings,
    ));
    let mut scheduler = orchestrator.start().await?;
    info!("orchestrator started; digest at 09:00/19:00 UTC plus silent hourly runs");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    scheduler.shutdown().await.ok();
    Ok(())
}

fn build_keyring(settings: &Settings) -> Result<Option<KeyRing>> {
    match settings.data_encryption_key.as_deref() {
        Some(spec) => Ok(Some(
            KeyRing::from_spec(spec).context("parse DATA_ENCRYPTION_KEY")?,
        )),
        None => {
            warn!("DATA_ENCRYPTION_KEY not set; user fields are stored in plaintext");
            Ok(None)
        }
    }
}
