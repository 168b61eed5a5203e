//! Discount percentage and the tunable weighted deal score.

use crate::models::ScoreWeights;

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Percent saved against a baseline, two decimals. `None` without a positive
/// baseline and a final price.
pub fn discount_pct(base: Option<i64>, price_final: Option<i64>) -> Option<f64> {
    match (base, price_final) {
        (Some(base), Some(price)) if base > 0 && price > 0 => {
            Some(round2((base - price) as f64 / base as f64 * 100.0))
        }
        _ => None,
    }
}

/// Weighted deal score.
///
/// Seller rating (0..5) scales to 0..100; shipping days count against the
/// score. Missing inputs contribute zero.
pub fn compute_score(
    discount: Option<f64>,
    abs_saving: Option<i64>,
    seller_rating: Option<f64>,
    shipping_days: Option<i64>,
    weights: &ScoreWeights,
) -> f64 {
    let dp = discount.unwrap_or(0.0);
    let abs = abs_saving.unwrap_or(0) as f64 / 100.0;
    let sr = seller_rating.unwrap_or(0.0) * 20.0;
    let sd = -(shipping_days.unwrap_or(0) as f64);
    round2(
        weights.discount * dp + weights.abs * abs + weights.seller * sr + weights.shipping * sd
            + weights.base,
    )
}
