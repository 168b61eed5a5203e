//! Offer normalization: title cleanup, brand guessing, fingerprints and the
//! final-price computation.

use regex::Regex;
use std::sync::OnceLock;

use crate::models::{NormalizedOffer, RawOffer};
use crate::processing::pricing::compute_final_price;

/// Brands we can reliably spot inside a listing title.
const KNOWN_BRANDS: &[&str] = &[
    "lenovo", "asus", "acer", "hp", "huawei", "apple", "samsung", "xiaomi", "realme", "dell",
    "msi",
];

/// Product fingerprints are full md5 digests; image hashes keep 16 hex chars.
const IMG_HASH_LEN: usize = 16;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Collapses runs of whitespace and trims the ends.
pub fn norm_title(title: &str) -> String {
    whitespace_re().replace_all(title, " ").trim().to_string()
}

/// Title-cases a human-readable name (`"re:store moscow"` → `"Re:store Moscow"`).
fn std_name(value: &str) -> Option<String> {
    let cleaned = norm_title(value);
    if cleaned.is_empty() {
        return None;
    }
    let cased = cleaned
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + chars.as_str().to_lowercase().as_str()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    Some(cased)
}

pub fn std_seller(value: Option<&str>) -> Option<String> {
    value.and_then(std_name)
}

/// Allow-list brand lookup over the lowercased title.
pub fn guess_brand(title: &str) -> Option<String> {
    let lower = title.to_lowercase();
    for brand in KNOWN_BRANDS {
        if lower.contains(brand) {
            return std_name(brand);
        }
    }
    None
}

/// Content fingerprint: md5 over the space-joined lowercase title, brand and
/// model. Deterministic for equal normalized inputs.
pub fn fingerprint(title: &str, brand: Option<&str>, model: Option<&str>) -> String {
    let mut parts: Vec<String> = vec![title.to_lowercase()];
    if let Some(brand) = brand {
        parts.push(brand.to_string());
    }
    if let Some(model) = model {
        parts.push(model.to_string());
    }
    let base = parts.join(" ");
    format!("{:x}", md5::compute(base.as_bytes()))
}

/// Image fingerprint: truncated md5 of the image URL.
pub fn img_hash(img_url: &str) -> String {
    let digest = format!("{:x}", md5::compute(img_url.as_bytes()));
    digest[..IMG_HASH_LEN].to_string()
}

/// Builds the canonical offer from a parsed card.
///
/// `external_id` is extracted from the URL by the site adapter;
/// `shipping_cost` is the configured flat surcharge.
pub fn normalize(raw: &RawOffer, external_id: String, shipping_cost: i64) -> NormalizedOffer {
    let title = norm_title(&raw.title);
    let brand = guess_brand(&title);
    let seller = std_seller(raw.seller.as_deref());
    let finger = fingerprint(&title, brand.as_deref(), None);
    let img_hash = raw.img.as_deref().map(img_hash);

    let price_final = compute_final_price(
        raw.price,
        &raw.promo_flags,
        raw.shipping_days,
        raw.shipping_included,
        raw.subscription,
        raw.price_in_cart,
        shipping_cost,
    );

    NormalizedOffer {
        source: raw.source,
        external_id,
        title,
        url: raw.url.clone(),
        img: raw.img.clone(),
        img_hash,
        brand,
        category: None,
        seller,
        finger,
        price: raw.price,
        price_old: raw.price_old,
        price_final,
        discount_pct: None,
        shipping_days: raw.shipping_days,
        promo_flags: raw.promo_flags.clone(),
        shipping_included: raw.shipping_included,
        price_in_cart: raw.price_in_cart,
        subscription: raw.subscription,
        geoid: raw.geoid.clone(),
    }
}
