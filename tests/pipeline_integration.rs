//! End-to-end pipeline semantics on an in-memory store: normalize → dedupe →
//! upsert → features → score → filter, without a browser in the loop.

use chrono::{Duration, Utc};

use dealbot_backend::models::{RawOffer, Site};
use dealbot_backend::processing::features::trend_30d;
use dealbot_backend::processing::{dedupe_offers, normalize, persist_and_score, ScoreContext};
use dealbot_backend::storage::Store;

const SHIPPING_COST: i64 = 199;

fn raw_card(title: &str, url: &str, price: i64, img: Option<&str>) -> RawOffer {
    let mut raw = RawOffer::new(Site::Ozon, title, url);
    raw.price = Some(price);
    raw.img = img.map(|s| s.to_string());
    raw.geoid = Some("213".into());
    raw
}

#[tokio::test]
async fn raw_cards_flow_to_ranked_deals() {
    let store = Store::open_in_memory(None).unwrap();
    let now = Utc::now();

    // Two cards for the same product (one cheaper), one unrelated card.
    let raws = vec![
        raw_card(
            "Ноутбук Lenovo IdeaPad 3",
            "https://www.ozon.ru/product/lenovo-1/",
            52_000,
            Some("https://cdn/lenovo.jpg"),
        ),
        raw_card(
            "ноутбук  lenovo   ideapad 3",
            "https://www.ozon.ru/product/lenovo-2/",
            48_000,
            Some("https://cdn/lenovo-alt.jpg"),
        ),
        raw_card(
            "Смартфон Xiaomi Redmi 12",
            "https://www.ozon.ru/product/xiaomi-3/",
            12_000,
            None,
        ),
    ];

    let normalized: Vec<_> = raws
        .iter()
        .enumerate()
        .map(|(i, raw)| normalize(raw, format!("id-{i}"), SHIPPING_COST))
        .collect();
    // Equal normalized titles produce equal fingerprints and collapse to the
    // cheaper offer.
    assert_eq!(normalized[0].finger, normalized[1].finger);
    let deduped = dedupe_offers(normalized);
    assert_eq!(deduped.len(), 2);
    assert_eq!(deduped[0].price_final, Some(48_000));

    let ctx = ScoreContext::new(0, 0, None);
    let deals = persist_and_score(&store, &ctx, &deduped, now).await.unwrap();
    assert_eq!(deals.len(), 2);
    assert!(deals[0].score >= deals[1].score);

    // Upserts created one product per URL with aggregates persisted.
    let lenovo = store
        .product_by_url("https://www.ozon.ru/product/lenovo-2/")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lenovo.avg_price_30d, Some(48_000));
    assert_eq!(lenovo.brand.as_deref(), Some("Lenovo"));
    assert!(lenovo.img_hash.is_some());
}

#[tokio::test]
async fn repeated_runs_accumulate_append_only_history() {
    let store = Store::open_in_memory(None).unwrap();
    let now = Utc::now();
    let raw = raw_card("Телевизор LG 50", "https://www.ozon.ru/product/lg-5/", 30_000, None);
    let n = normalize(&raw, "lg-5".into(), SHIPPING_COST);

    let ctx = ScoreContext::new(0, 1_000_000, None);
    for day in [3, 2, 1] {
        persist_and_score(&store, &ctx, &[n.clone()], now - Duration::days(day))
            .await
            .unwrap();
    }
    let product = store
        .product_by_url("https://www.ozon.ru/product/lg-5/")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.history_len(product.id).await.unwrap(), 3);
}

#[tokio::test]
async fn reference_history_yields_expected_features() {
    let store = Store::open_in_memory(None).unwrap();
    let now = Utc::now();
    let url = "https://www.ozon.ru/product/ref-7/";

    for (days_ago, price) in [(40, 200), (20, 100), (10, 80), (1, 120)] {
        let mut raw = raw_card("Эталонный товар", url, price, None);
        raw.price = Some(price);
        let n = normalize(&raw, "ref-7".into(), SHIPPING_COST);
        store
            .upsert_offer(&n, now - Duration::days(days_ago))
            .await
            .unwrap();
    }
    let product = store.product_by_url(url).await.unwrap().unwrap();

    let stats30 = store.window_stats(product.id, 30, now).await.unwrap();
    let stats90 = store.window_stats(product.id, 90, now).await.unwrap();
    assert_eq!(stats30.avg, Some(100));
    assert_eq!(stats30.min, Some(80));
    assert_eq!(stats90.avg, Some(125));
    assert_eq!(stats90.min, Some(80));

    let points = store.history_points_30d(product.id, now).await.unwrap();
    let trend = trend_30d(&points).unwrap();
    // OLS slope ≈ 0.9963/day projected over 30 days of the first price (100).
    assert!((trend - 29.89).abs() < 0.01, "trend={trend}");
}
