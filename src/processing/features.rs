//! Rolling price features: windowed aggregates and the 30-day trend.

use chrono::{DateTime, Utc};

use crate::processing::score::round2;

/// Aggregates over one history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceStats {
    pub avg: Option<i64>,
    pub min: Option<i64>,
}

/// Ordinary-least-squares 30-day price trend, percent.
///
/// Input: `(ts, price_final)` points inside the 30-day window, ordered by
/// timestamp. The slope (price units per day) is projected over 30 days and
/// expressed relative to the first observed price. `None` with fewer than two
/// points, a degenerate x-spread or a zero first price.
pub fn trend_30d(points: &[(DateTime<Utc>, i64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let base_ts = points[0].0;
    let xs: Vec<f64> = points
        .iter()
        .map(|(ts, _)| (*ts - base_ts).num_seconds() as f64 / 86_400.0)
        .collect();
    let ys: Vec<f64> = points.iter().map(|(_, price)| *price as f64).collect();

    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();
    let sum_xy: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;

    let first = ys[0];
    if first == 0.0 {
        return None;
    }
    Some(round2(slope * 30.0 / first * 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn points(spec: &[(i64, i64)]) -> Vec<(DateTime<Utc>, i64)> {
        let now = Utc::now();
        spec.iter()
            .map(|(days_ago, price)| (now - Duration::days(*days_ago), *price))
            .collect()
    }

    #[test]
    fn needs_at_least_two_points() {
        assert_eq!(trend_30d(&[]), None);
        assert_eq!(trend_30d(&points(&[(5, 100)])), None);
    }

    #[test]
    fn zero_first_price_is_degenerate() {
        assert_eq!(trend_30d(&points(&[(10, 0), (5, 100)])), None);
    }

    #[test]
    fn coincident_timestamps_are_degenerate() {
        let now = Utc::now();
        assert_eq!(trend_30d(&[(now, 100), (now, 200)]), None);
    }

    #[test]
    fn steady_decline_projects_negative() {
        // 100 → 70 over 30 days: slope −1/day, projected −30% of the first price.
        let t = trend_30d(&points(&[(30, 100), (15, 85), (0, 70)])).unwrap();
        assert_eq!(t, -30.0);
    }

    #[test]
    fn reference_window_projects_recovery() {
        // Points at −20d/−10d/−1d (the −40d point falls outside the window):
        // slope ≈ 0.9963 per day over first=100 → ≈ 29.89%.
        let t = trend_30d(&points(&[(20, 100), (10, 80), (1, 120)])).unwrap();
        assert!((t - 29.89).abs() < 0.01, "got {t}");
    }
}
