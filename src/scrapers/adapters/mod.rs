//! Site adapters: region cookies, region verification, listing/product
//! parsing and external-id extraction, one implementation per marketplace.

pub mod market;
pub mod ozon;

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{PromoFlags, RawOffer, Site, PROMO_INSTANT_COUPON};
use crate::scrapers::selectors::SelectorRegistry;

pub use market::MarketAdapter;
pub use ozon::OzonAdapter;

/// Cookie handed to the render pool before navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

impl Cookie {
    pub fn new(name: &str, value: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
        }
    }
}

/// Per-site scraping behavior. Dispatched by `Site`.
pub trait SiteAdapter: Send + Sync {
    fn site(&self) -> Site;

    /// CSS selector the render pool waits for on listing pages.
    fn listing_wait_selector(&self) -> &'static str;

    /// Cookies that pin the requested region.
    fn region_cookies(&self, geoid: &str) -> Vec<Cookie>;

    /// City label displayed in the page header, if any.
    fn city_from_html(&self, html: &str) -> Option<String>;

    /// Whether the rendered page matches the requested geoid. Geoids missing
    /// from the region map pass unconditionally.
    fn ensure_region(&self, html: &str, geoid: &str) -> bool;

    /// Offers on a category listing. Cards without a link or price are
    /// skipped, never fatal.
    fn parse_listing(&self, html: &str, geoid: Option<&str>) -> Vec<RawOffer>;

    /// Single product page.
    fn parse_product(&self, html: &str, geoid: Option<&str>) -> RawOffer;

    /// Stable external id extracted from a product URL.
    fn external_id_from_url(&self, url: &str) -> String;
}

/// Both adapters, constructed once with the shared selector registry and
/// region map.
pub struct AdapterRegistry {
    ozon: OzonAdapter,
    market: MarketAdapter,
}

impl AdapterRegistry {
    pub fn new(selectors: SelectorRegistry, region_map: HashMap<String, String>) -> Self {
        Self {
            ozon: OzonAdapter::new(selectors.clone(), region_map.clone()),
            market: MarketAdapter::new(selectors, region_map),
        }
    }

    pub fn get(&self, site: Site) -> &dyn SiteAdapter {
        match site {
            Site::Ozon => &self.ozon,
            Site::Market => &self.market,
        }
    }
}

/// Checks a displayed city against the configured expectation for `geoid`.
pub(crate) fn verify_region(
    region_map: &HashMap<String, String>,
    city: Option<&str>,
    geoid: &str,
) -> bool {
    match region_map.get(geoid) {
        Some(expected) => city.map(|c| c == expected).unwrap_or(false),
        None => true,
    }
}

/// Digits-only price extraction (`"1 990 ₽"` → 1990).
pub(crate) fn extract_price(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn coupon_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"купон\D{0,16}(\d+)").expect("static regex"))
}

fn shipping_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)[^\d]{0,5}дн").expect("static regex"))
}

/// Promo and logistics hints scraped from the card's visible text.
#[derive(Debug, Default, Clone)]
pub(crate) struct CardHints {
    pub promo_flags: PromoFlags,
    pub shipping_days: Option<i64>,
    pub shipping_included: bool,
    pub price_in_cart: bool,
    pub subscription: bool,
}

/// Runs the RU-text heuristics over the lowercased card text.
pub(crate) fn card_hints(text: &str) -> CardHints {
    let lower = text.to_lowercase();
    let mut hints = CardHints::default();

    if let Some(caps) = coupon_re().captures(&lower) {
        if let Ok(amount) = caps[1].parse::<i64>() {
            hints.promo_flags.set_amount(PROMO_INSTANT_COUPON, amount);
        }
    }
    if let Some(caps) = shipping_re().captures(&lower) {
        hints.shipping_days = caps[1].parse::<i64>().ok();
    }
    hints.shipping_included = lower.contains("бесп");
    hints.price_in_cart = lower.contains("корзин");
    hints.subscription = lower.contains("подпис");
    hints
}

/// Title fallback + 200-char cap shared by both parsers.
pub(crate) fn clamp_title(title: &str, fallback: &str) -> String {
    let trimmed = title.trim();
    let title = if trimmed.is_empty() { fallback } else { trimmed };
    title.chars().take(200).collect()
}
