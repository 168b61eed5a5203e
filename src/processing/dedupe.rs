//! Offer deduplication on fingerprint and image hash.

use std::collections::HashMap;

use crate::models::NormalizedOffer;

fn effective_price(offer: &NormalizedOffer) -> i64 {
    offer.price_final.unwrap_or(i64::MAX)
}

/// Collapses duplicates, keeping the cheapest offer of every equivalence
/// class. Classes are joined on `finger` or, when an image is present, on
/// `img_hash`; first-seen output order is preserved and a cheaper duplicate
/// replaces its predecessor in place.
pub fn dedupe_offers(items: Vec<NormalizedOffer>) -> Vec<NormalizedOffer> {
    let mut result: Vec<NormalizedOffer> = Vec::with_capacity(items.len());
    let mut by_finger: HashMap<String, usize> = HashMap::new();
    let mut by_img: HashMap<String, usize> = HashMap::new();

    for offer in items {
        let existing = by_finger
            .get(&offer.finger)
            .or_else(|| offer.img_hash.as_ref().and_then(|h| by_img.get(h)))
            .copied();

        match existing {
            Some(idx) => {
                if effective_price(&offer) < effective_price(&result[idx]) {
                    by_finger.insert(offer.finger.clone(), idx);
                    if let Some(h) = &offer.img_hash {
                        by_img.insert(h.clone(), idx);
                    }
                    result[idx] = offer;
                }
            }
            None => {
                let idx = result.len();
                by_finger.insert(offer.finger.clone(), idx);
                if let Some(h) = &offer.img_hash {
                    by_img.insert(h.clone(), idx);
                }
                result.push(offer);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PromoFlags, Site};

    fn offer(finger: &str, img: Option<&str>, price_final: Option<i64>) -> NormalizedOffer {
        NormalizedOffer {
            source: Site::Ozon,
            external_id: finger.to_string(),
            title: format!("t-{finger}"),
            url: format!("https://www.ozon.ru/product/{finger}/"),
            img: img.map(|s| format!("https://cdn/{s}.jpg")),
            img_hash: img.map(|s| s.to_string()),
            brand: None,
            category: None,
            seller: None,
            finger: finger.to_string(),
            price: price_final,
            price_old: None,
            price_final,
            discount_pct: None,
            shipping_days: None,
            promo_flags: PromoFlags::new(),
            shipping_included: false,
            price_in_cart: false,
            subscription: false,
            geoid: None,
        }
    }

    #[test]
    fn same_fingerprint_keeps_the_cheaper_offer() {
        let out = dedupe_offers(vec![
            offer("f1", None, Some(100)),
            offer("f1", None, Some(90)),
            offer("f1", None, Some(95)),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price_final, Some(90));
    }

    #[test]
    fn image_hash_joins_distinct_fingerprints() {
        let out = dedupe_offers(vec![
            offer("f1", Some("i1"), Some(100)),
            offer("f2", Some("i1"), Some(90)),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].finger, "f2");
        assert_eq!(out[0].price_final, Some(90));
    }

    #[test]
    fn missing_price_loses_to_any_price() {
        let out = dedupe_offers(vec![
            offer("f1", None, None),
            offer("f1", None, Some(1_000_000)),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price_final, Some(1_000_000));
    }

    #[test]
    fn order_is_first_seen_and_replacement_is_in_place() {
        let out = dedupe_offers(vec![
            offer("a", None, Some(10)),
            offer("b", None, Some(20)),
            offer("b", None, Some(5)),
            offer("c", None, Some(30)),
        ]);
        let fingers: Vec<_> = out.iter().map(|o| o.finger.as_str()).collect();
        assert_eq!(fingers, vec!["a", "b", "c"]);
        assert_eq!(out[1].price_final, Some(5));
    }

    #[test]
    fn offers_without_images_dedupe_on_fingerprint_only() {
        let out = dedupe_offers(vec![
            offer("f1", None, Some(50)),
            offer("f2", None, Some(40)),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn output_never_grows() {
        let input = vec![
            offer("x", Some("i"), Some(1)),
            offer("y", Some("i"), Some(2)),
            offer("z", Some("j"), Some(3)),
        ];
        let len = input.len();
        assert!(dedupe_offers(input).len() <= len);
    }
}
