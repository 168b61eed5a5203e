//! Synthetic-discount detection.

const FAKE_MSRP_FACTOR: f64 = 1.5;

/// Flags a crossed-out "old price" that towers over the historical baseline.
///
/// The baseline is `min(avg_30d, min_90d)`; both aggregates must be present,
/// otherwise the detector stays silent.
pub fn is_fake_msrp(price_old: Option<i64>, avg_30d: Option<i64>, min_90d: Option<i64>) -> bool {
    let (Some(price_old), Some(avg), Some(min)) = (price_old, avg_30d, min_90d) else {
        return false;
    };
    let baseline = avg.min(min);
    baseline > 0 && (price_old as f64) > baseline as f64 * FAKE_MSRP_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflated_msrp_is_flagged() {
        assert!(is_fake_msrp(Some(200), Some(100), Some(80)));
    }

    #[test]
    fn plausible_msrp_passes() {
        assert!(!is_fake_msrp(Some(110), Some(100), Some(80)));
        // Exactly 1.5x is still plausible.
        assert!(!is_fake_msrp(Some(120), Some(100), Some(80)));
    }

    #[test]
    fn missing_baseline_means_no_flag() {
        assert!(!is_fake_msrp(Some(1000), None, Some(80)));
        assert!(!is_fake_msrp(Some(1000), Some(100), None));
        assert!(!is_fake_msrp(None, Some(100), Some(80)));
    }
}
