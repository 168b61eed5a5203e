//! Failure snapshots: HTML + PNG pairs uploaded to S3/MinIO with a bounded
//! lifetime, so broken pages can be inspected after the fact.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;

pub const PREFIX_ERRORS: &str = "errors";
pub const PREFIX_SCHEMA: &str = "schema";

/// Uploads page snapshots. With no bucket configured every call is a no-op,
/// so callers never have to branch on configuration.
#[derive(Clone)]
pub struct SnapshotStore {
    bucket: Option<Bucket>,
    ttl_days: i64,
}

impl SnapshotStore {
    pub fn disabled() -> Self {
        Self {
            bucket: None,
            ttl_days: 0,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let Some(name) = settings.s3_bucket.as_deref() else {
            return Ok(Self::disabled());
        };
        let region = match settings.s3_endpoint.clone() {
            Some(endpoint) => Region::Custom {
                region: settings.s3_region.clone(),
                endpoint,
            },
            None => settings
                .s3_region
                .parse()
                .context("parse S3_REGION")?,
        };
        let credentials = Credentials::new(
            settings.s3_access_key.as_deref(),
            settings.s3_secret_key.as_deref(),
            None,
            None,
            None,
        )
        .context("build S3 credentials")?;
        let bucket = Bucket::new(name, region, credentials)
            .context("open S3 bucket")?
            .with_path_style();
        Ok(Self {
            bucket: Some(bucket),
            ttl_days: settings.snapshot_ttl_days,
        })
    }

    /// Stores `<prefix>/<domain>/<UTC stamp>-<uuid>.{html,png}` and returns
    /// the base key. Upload failures are logged, never propagated: snapshots
    /// are diagnostics, not part of the task outcome.
    pub async fn save(
        &self,
        prefix: &str,
        page_url: &str,
        html: &str,
        screenshot: &[u8],
    ) -> Option<String> {
        let bucket = self.bucket.as_ref()?;
        let domain = url::Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let base = format!("{prefix}/{domain}/{stamp}-{}", Uuid::new_v4());

        let expires = (Utc::now() + Duration::days(self.ttl_days))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut bucket = bucket.clone();
        bucket.add_header("Expires", &expires);

        if let Err(err) = bucket
            .put_object_with_content_type(format!("{base}.html"), html.as_bytes(), "text/html")
            .await
        {
            warn!(%err, key = %base, "failed to upload html snapshot");
            return None;
        }
        if !screenshot.is_empty() {
            if let Err(err) = bucket
                .put_object_with_content_type(format!("{base}.png"), screenshot, "image/png")
                .await
            {
                warn!(%err, key = %base, "failed to upload png snapshot");
            }
        }
        debug!(key = %base, "saved page snapshot");
        Some(base)
    }
}
