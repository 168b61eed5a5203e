//! The per-task processing pipeline:
//! fetch → parse → region-verify → normalize → dedupe → upsert → features →
//! score → filter, returning admitted deals sorted by descending score.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TaskError;
use crate::models::{
    DealItem, NormalizedOffer, ScoreWeightOverrides, ScoreWeights, Site, EVENT_PRICE_DROP,
};
use crate::observability::{CategoryStats, ListingStats};
use crate::processing::dedupe::dedupe_offers;
use crate::processing::detectors::is_fake_msrp;
use crate::processing::features::trend_30d;
use crate::processing::normalize::normalize;
use crate::processing::score::{compute_score, discount_pct};
use crate::notifier::Monitoring;
use crate::scrapers::{AdapterRegistry, FetchOptions, RenderPool};
use crate::storage::{SnapshotStore, Store, PREFIX_ERRORS, PREFIX_SCHEMA};

/// Scoring/admission parameters for one task.
#[derive(Debug, Clone)]
pub struct ScoreContext {
    pub min_discount: i64,
    pub min_score: i64,
    pub weights: ScoreWeights,
}

impl ScoreContext {
    pub fn new(
        min_discount: i64,
        min_score: i64,
        overrides: Option<&ScoreWeightOverrides>,
    ) -> Self {
        Self {
            min_discount,
            min_score,
            weights: ScoreWeights::with_overrides(overrides),
        }
    }
}

pub struct Pipeline {
    pub store: Store,
    pub render: Arc<RenderPool>,
    pub adapters: Arc<AdapterRegistry>,
    pub snapshots: SnapshotStore,
    pub monitoring: Arc<Monitoring>,
    pub listing_stats: Arc<ListingStats>,
    pub category_stats: Arc<CategoryStats>,
    pub shipping_cost: i64,
    pub default_geoid: String,
}

impl Pipeline {
    /// Runs the whole chain for one category listing.
    pub async fn process_preset(
        &self,
        site: Site,
        url: &str,
        geoid: Option<&str>,
        category: Option<&str>,
        ctx: &ScoreContext,
    ) -> Result<Vec<DealItem>, TaskError> {
        let adapter = self.adapters.get(site);
        let geoid_actual = geoid.unwrap_or(&self.default_geoid).to_string();
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        let fetched = self
            .render
            .fetch(
                url,
                FetchOptions {
                    cookies: adapter.region_cookies(&geoid_actual),
                    wait_selector: Some(adapter.listing_wait_selector().to_string()),
                    region_hint: geoid.map(|g| g.to_string()),
                    ..FetchOptions::default()
                },
            )
            .await?;

        if !adapter.ensure_region(&fetched.html, &geoid_actual) {
            let city = adapter.city_from_html(&fetched.html);
            warn!(%url, geoid = %geoid_actual, ?city, "rendered page shows the wrong region");
            self.snapshots
                .save(PREFIX_ERRORS, url, &fetched.html, &fetched.screenshot)
                .await;
            return Err(TaskError::RegionMismatch {
                geoid: geoid_actual,
                city,
            });
        }

        let mut raws = adapter.parse_listing(&fetched.html, geoid);
        self.listing_stats.record(&domain, raws.is_empty());
        if raws.is_empty() {
            // A rendered page that yields nothing is a selector-drift signal,
            // not a task failure.
            if fetched.html.len() > 1024 {
                counter!("parse_errors_total", 1, "domain" => domain.clone());
            }
            debug!(%url, "empty listing");
            self.snapshots
                .save(PREFIX_SCHEMA, url, &fetched.html, &fetched.screenshot)
                .await;
            return Ok(Vec::new());
        }
        for raw in &mut raws {
            if raw.geoid.is_none() {
                raw.geoid = Some(geoid_actual.clone());
            }
        }

        let mut normalized: Vec<NormalizedOffer> = raws
            .iter()
            .map(|raw| {
                let external_id = adapter.external_id_from_url(&raw.url);
                normalize(raw, external_id, self.shipping_cost)
            })
            .collect();
        if let Some(category) = category {
            for item in &mut normalized {
                item.category = Some(category.to_string());
            }
        }
        let normalized = dedupe_offers(normalized);

        self.category_stats
            .update(&normalized, &self.monitoring)
            .await;

        let results = persist_and_score(&self.store, ctx, &normalized, Utc::now())
            .await
            .map_err(TaskError::Other)?;
        info!(
            %url,
            offers = normalized.len(),
            admitted = results.len(),
            "preset processed"
        );
        Ok(results)
    }
}

/// Persists normalized offers and computes features, scores and admission.
///
/// Split from the fetch half so storage semantics are testable without a
/// browser. Admission: `discount_pct >= min_discount` OR `score >= min_score`;
/// output is sorted by descending score.
pub async fn persist_and_score(
    store: &Store,
    ctx: &ScoreContext,
    offers: &[NormalizedOffer],
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<DealItem>> {
    let mut results: Vec<DealItem> = Vec::new();

    for item in offers {
        let outcome = store
            .upsert_offer(item, now)
            .await
            .context("upsert offer")?;

        let stats30 = store.window_stats(outcome.product_id, 30, now).await?;
        let stats90 = store.window_stats(outcome.product_id, 90, now).await?;
        let points = store.history_points_30d(outcome.product_id, now).await?;
        let trend = trend_30d(&points);
        store
            .save_aggregates(outcome.product_id, stats30, stats90, trend)
            .await?;

        let abs_saving = match (stats30.avg, item.price_final) {
            (Some(avg), Some(price)) => Some(avg - price),
            _ => None,
        };
        let base = item.price_old.or(stats30.avg);
        let disc = discount_pct(base, item.price_final);
        let fake_msrp = is_fake_msrp(item.price_old, stats30.avg, stats90.min);
        let score = compute_score(disc, abs_saving, None, item.shipping_days, &ctx.weights);

        store
            .save_offer_scores(outcome.offer_id, disc, abs_saving, score, fake_msrp)
            .await?;

        let admitted = disc.map(|d| d >= ctx.min_discount as f64).unwrap_or(false)
            || score >= ctx.min_score as f64;
        if admitted {
            store
                .insert_event(
                    outcome.product_id,
                    EVENT_PRICE_DROP,
                    &serde_json::json!({
                        "url": item.url,
                        "price_final": item.price_final,
                        "discount_pct": disc,
                        "score": score,
                    }),
                    now,
                )
                .await?;
            results.push(DealItem {
                title: item.title.clone(),
                url: item.url.clone(),
                price: item.price_final.or(item.price).unwrap_or(0),
                discount_pct: disc,
                score,
                source: item.source,
                img: item.img.clone(),
                fake_msrp,
            });
        }
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PromoFlags;
    use chrono::Duration;

    fn offer(url: &str, finger: &str, price_final: i64, price_old: Option<i64>) -> NormalizedOffer {
        NormalizedOffer {
            source: Site::Ozon,
            external_id: finger.to_string(),
            title: format!("t-{finger}"),
            url: url.to_string(),
            img: None,
            img_hash: None,
            brand: None,
            category: Some("phones".into()),
            seller: None,
            finger: finger.to_string(),
            price: Some(price_final),
            price_old,
            price_final: Some(price_final),
            discount_pct: None,
            shipping_days: None,
            promo_flags: PromoFlags::new(),
            shipping_included: false,
            price_in_cart: false,
            subscription: false,
            geoid: Some("213".into()),
        }
    }

    #[tokio::test]
    async fn admission_by_discount_or_score() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        // Seed history so the 30d average is 1000.
        for days in [20, 10] {
            store
                .upsert_offer(&offer("https://o/deal", "fd", 1000, None), now - Duration::days(days))
                .await
                .unwrap();
        }

        let ctx = ScoreContext::new(25, 70, None);
        // Well below the 30d average (which now includes this observation:
        // avg(1000, 1000, 600) = 866): admitted by discount.
        let results = persist_and_score(&store, &ctx, &[offer("https://o/deal", "fd", 600, None)], now)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].discount_pct, Some(30.72));

        // Small discount, low score: rejected.
        let results = persist_and_score(&store, &ctx, &[offer("https://o/deal", "fd", 950, None)], now)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn results_are_sorted_by_score_descending() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let ctx = ScoreContext::new(0, 0, None);
        let offers = vec![
            offer("https://o/a", "fa", 900, Some(1000)),
            offer("https://o/b", "fb", 500, Some(1000)),
            offer("https://o/c", "fc", 700, Some(1000)),
        ];
        let results = persist_and_score(&store, &ctx, &offers, now).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].score >= results[1].score);
        assert!(results[1].score >= results[2].score);
        assert_eq!(results[0].url, "https://o/b");
    }

    #[tokio::test]
    async fn fake_msrp_needs_both_baselines() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let ctx = ScoreContext::new(0, 0, None);
        // First sighting: history exists only from this run, both baselines
        // resolve to the current price, so a 3x crossed-out price flags.
        let first = persist_and_score(
            &store,
            &ctx,
            &[offer("https://o/msrp", "fm", 100, Some(300))],
            now,
        )
        .await
        .unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].fake_msrp);
    }

    #[tokio::test]
    async fn price_drop_events_and_scores_are_persisted() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let ctx = ScoreContext::new(0, 0, None);
        persist_and_score(&store, &ctx, &[offer("https://o/ev", "fe", 500, Some(1000))], now)
            .await
            .unwrap();
        let product = store.product_by_url("https://o/ev").await.unwrap().unwrap();
        // Aggregates were persisted on the product row as part of the run.
        assert_eq!(product.avg_price_30d, Some(500));

        let saved = store.latest_offer(product.id).await.unwrap().unwrap();
        assert_eq!(saved.discount_pct, Some(50.0));
        assert!(saved.score.unwrap() > 0.0);
        // First sighting: the only baseline is this very observation, so the
        // 2x crossed-out price reads as synthetic.
        assert_eq!(saved.fake_msrp, Some(true));

        let events = store.events_for_product(product.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EVENT_PRICE_DROP);
        assert_eq!(events[0].payload.as_ref().unwrap()["price_final"], 500);
    }
}
