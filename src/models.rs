use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monitored marketplaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Ozon,
    Market,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Ozon => "ozon",
            Site::Market => "market",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Site {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ozon" => Ok(Site::Ozon),
            "market" => Ok(Site::Market),
            other => Err(format!("unknown site: {other}")),
        }
    }
}

/// A single promo marker on a card: either an amount (e.g. an instant coupon
/// in rubles) or a plain flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromoValue {
    Amount(i64),
    Flag(bool),
}

/// Tagged promo map: known labels plus whatever else the card exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromoFlags(pub BTreeMap<String, PromoValue>);

pub const PROMO_INSTANT_COUPON: &str = "instant_coupon";

impl PromoFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_amount(&mut self, label: &str, value: i64) {
        self.0.insert(label.to_string(), PromoValue::Amount(value));
    }

    pub fn set_flag(&mut self, label: &str, value: bool) {
        self.0.insert(label.to_string(), PromoValue::Flag(value));
    }

    /// Instant-coupon amount; absent or non-integer labels count as zero.
    pub fn instant_coupon(&self) -> i64 {
        match self.0.get(PROMO_INSTANT_COUPON) {
            Some(PromoValue::Amount(v)) => *v,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Offer as parsed from a listing card or product page, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOffer {
    pub source: Site,
    pub title: String,
    pub url: String,
    pub img: Option<String>,
    pub seller: Option<String>,
    pub price: Option<i64>,
    pub price_old: Option<i64>,
    pub shipping_days: Option<i64>,
    pub promo_flags: PromoFlags,
    pub shipping_included: bool,
    pub price_in_cart: bool,
    pub subscription: bool,
    pub geoid: Option<String>,
}

impl RawOffer {
    pub fn new(source: Site, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source,
            title: title.into(),
            url: url.into(),
            img: None,
            seller: None,
            price: None,
            price_old: None,
            shipping_days: None,
            promo_flags: PromoFlags::new(),
            shipping_included: false,
            price_in_cart: false,
            subscription: false,
            geoid: None,
        }
    }
}

/// Canonical offer after title cleanup, fingerprinting and final-price
/// computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedOffer {
    pub source: Site,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub img: Option<String>,
    /// 16-hex digest of the image URL, when an image is present.
    pub img_hash: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub seller: Option<String>,
    /// 32-hex content fingerprint.
    pub finger: String,
    pub price: Option<i64>,
    pub price_old: Option<i64>,
    pub price_final: Option<i64>,
    pub discount_pct: Option<f64>,
    pub shipping_days: Option<i64>,
    pub promo_flags: PromoFlags,
    pub shipping_included: bool,
    pub price_in_cart: bool,
    pub subscription: bool,
    pub geoid: Option<String>,
}

/// Canonical product row, unique on `(source, external_id)` and on `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub source: Site,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub img: Option<String>,
    pub img_hash: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub finger: String,
    pub geoid_created: Option<String>,
    pub avg_price_30d: Option<i64>,
    pub min_price_30d: Option<i64>,
    pub avg_price_90d: Option<i64>,
    pub min_price_90d: Option<i64>,
    /// Projected 30-day price trend, percent.
    pub trend_30d: Option<f64>,
}

/// Per-observation snapshot for a product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub product_id: i64,
    pub price: Option<i64>,
    pub price_old: Option<i64>,
    pub price_final: Option<i64>,
    pub seller: Option<String>,
    pub shipping_days: Option<i64>,
    pub promo_flags: PromoFlags,
    pub price_in_cart: bool,
    pub subscription: bool,
    pub scraped_at: DateTime<Utc>,
    pub discount_pct: Option<f64>,
    pub abs_saving: Option<i64>,
    pub score: Option<f64>,
    pub fake_msrp: Option<bool>,
}

/// Append-only price observation; source of truth for rolling features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub product_id: i64,
    pub ts: DateTime<Utc>,
    pub price_final: Option<i64>,
    pub seller: Option<String>,
}

/// Typed event log entry (price drops etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub product_id: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: Option<serde_json::Value>,
}

pub const EVENT_PRICE_DROP: &str = "price_drop";

/// Subscriber profile: region, thresholds, optional category filter and
/// personal crontab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub chat_id: i64,
    pub geoid: String,
    pub min_discount: i64,
    pub min_score: i64,
    pub categories: Option<Vec<String>>,
    pub score_weights: Option<ScoreWeightOverrides>,
    pub schedule_cron: Option<String>,
}

/// User↔product pin with optional per-pin overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Favorite {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub created_at: DateTime<Utc>,
    pub geoid: Option<String>,
    pub min_discount: Option<i64>,
    pub min_score: Option<i64>,
    pub schedule_cron: Option<String>,
}

/// Weighted-score coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub discount: f64,
    pub abs: f64,
    pub seller: f64,
    pub shipping: f64,
    pub base: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            discount: 0.4,
            abs: 0.3,
            seller: 0.2,
            shipping: 0.1,
            base: 10.0,
        }
    }
}

/// Per-field weight override carried in task payloads and user profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeightOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<f64>,
}

impl ScoreWeights {
    pub fn with_overrides(overrides: Option<&ScoreWeightOverrides>) -> Self {
        let mut w = Self::default();
        if let Some(o) = overrides {
            if let Some(v) = o.discount {
                w.discount = v;
            }
            if let Some(v) = o.abs {
                w.abs = v;
            }
            if let Some(v) = o.seller {
                w.seller = v;
            }
            if let Some(v) = o.shipping {
                w.shipping = v;
            }
            if let Some(v) = o.base {
                w.base = v;
            }
        }
        w
    }
}

/// Wire payload carried in the stream `data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub site: Site,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geoid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub min_discount: i64,
    pub min_score: i64,
    pub notify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<ScoreWeightOverrides>,
}

impl TaskPayload {
    pub fn new(site: Site, url: impl Into<String>) -> Self {
        Self {
            site,
            url: url.into(),
            geoid: None,
            category: None,
            min_discount: 0,
            min_score: 0,
            notify: false,
            url_template: None,
            page: None,
            chat_id: None,
            weights: None,
        }
    }
}

/// Admitted deal handed to the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealItem {
    pub title: String,
    pub url: String,
    pub price: i64,
    pub discount_pct: Option<f64>,
    pub score: f64,
    pub source: Site,
    pub img: Option<String>,
    pub fake_msrp: bool,
}
