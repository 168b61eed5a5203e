//! Metric registration plus the listing/category statistics that watch for
//! scraping anomalies.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;

use crate::models::NormalizedOffer;
use crate::notifier::monitoring::Monitoring;

/// Installs the Prometheus exporter and registers metric descriptions.
/// Call once per binary, after the runtime is up.
pub fn install_exporter(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install prometheus exporter")?;
    describe();
    Ok(())
}

/// Registers descriptions for every metric the service emits.
pub fn describe() {
    describe_counter!("dlq_tasks_total", "Total tasks processed from DLQ");
    describe_gauge!("dlq_backlog", "Current number of tasks in DLQ");
    describe_counter!("budget_exceeded_total", "Total budget exceed events");
    describe_counter!("tasks_skipped_total", "Total skipped tasks");
    describe_histogram!("render_latency_seconds", "Latency of page rendering");
    describe_counter!("render_errors_total", "Total render errors");
    describe_counter!("parse_errors_total", "Total parse errors");
    describe_gauge!("listing_empty_share", "Share of empty listings");
    describe_gauge!("category_avg_price", "Average price per category");
    describe_gauge!("category_no_price_share", "Share of items without price");
    describe_gauge!("category_price_p50", "Median price per category");
    describe_gauge!("category_price_p90", "P90 price per category");
}

/// Rolling share of empty listings per domain.
#[derive(Default)]
pub struct ListingStats {
    counts: Mutex<HashMap<String, (u64, u64)>>,
}

impl ListingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, domain: &str, empty: bool) {
        let share = {
            let mut counts = self.counts.lock();
            let entry = counts.entry(domain.to_string()).or_insert((0, 0));
            entry.0 += 1;
            if empty {
                entry.1 += 1;
            }
            entry.1 as f64 / entry.0 as f64
        };
        gauge!("listing_empty_share", share, "domain" => domain.to_string());
    }
}

/// Per-category price statistics. A halving or doubling of a category's card
/// count or average price between two runs raises a monitoring alert.
#[derive(Default)]
pub struct CategoryStats {
    previous: Mutex<HashMap<String, (usize, f64)>>,
}

impl CategoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, items: &[NormalizedOffer], monitoring: &Monitoring) {
        let mut grouped: HashMap<String, Vec<Option<i64>>> = HashMap::new();
        for item in items {
            let cat = item.category.clone().unwrap_or_else(|| "unknown".to_string());
            grouped.entry(cat).or_default().push(item.price);
        }

        let mut alerts = Vec::new();
        for (category, prices) in grouped {
            let total = prices.len();
            let mut priced: Vec<i64> = prices.iter().filter_map(|p| *p).collect();
            priced.sort_unstable();
            let with_price = priced.len();
            let avg = if with_price > 0 {
                priced.iter().sum::<i64>() as f64 / with_price as f64
            } else {
                0.0
            };
            let no_price_share = if total > 0 {
                (total - with_price) as f64 / total as f64
            } else {
                0.0
            };

            gauge!("category_avg_price", avg, "category" => category.clone());
            gauge!("category_no_price_share", no_price_share, "category" => category.clone());
            if !priced.is_empty() {
                gauge!("category_price_p50", quantile(&priced, 0.5), "category" => category.clone());
                gauge!("category_price_p90", quantile(&priced, 0.9), "category" => category.clone());
            }

            let mut previous = self.previous.lock();
            let (prev_total, prev_avg) = previous.get(&category).copied().unwrap_or((0, 0.0));
            if prev_total > 0
                && ((total as f64) < prev_total as f64 * 0.5
                    || (total as f64) > prev_total as f64 * 2.0)
            {
                alerts.push(format!(
                    "Anomalous card count in category {category}: {prev_total} -> {total}"
                ));
            }
            if prev_avg > 0.0 && (avg < prev_avg * 0.5 || avg > prev_avg * 2.0) {
                alerts.push(format!(
                    "Anomalous average price in category {category}: {prev_avg:.2} -> {avg:.2}"
                ));
            }
            previous.insert(category, (total, avg));
        }

        for alert in alerts {
            monitoring.notify(&alert).await;
        }
    }
}

/// Lower nearest-rank quantile of a sorted series.
fn quantile(sorted: &[i64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * q).floor() as usize;
    sorted[idx.min(sorted.len() - 1)] as f64
}
