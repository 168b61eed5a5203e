//! Final-price computation: coupons, shipping surcharge, subscription.

use crate::models::PromoFlags;

/// Computes the effective price of an offer.
///
/// Returns `None` when there is no price at all or the price is only shown in
/// the cart. An instant coupon is subtracted up front; the flat shipping
/// surcharge applies only when the offer ships (has `shipping_days`), is not
/// covered by a subscription and does not already include shipping.
pub fn compute_final_price(
    price: Option<i64>,
    promo_flags: &PromoFlags,
    shipping_days: Option<i64>,
    shipping_included: bool,
    subscription: bool,
    price_in_cart: bool,
    shipping_cost: i64,
) -> Option<i64> {
    let price = match price {
        Some(p) if !price_in_cart => p,
        _ => return None,
    };

    let mut total = price - promo_flags.instant_coupon();
    if shipping_days.is_some() && !subscription && !shipping_included {
        total += shipping_cost;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PROMO_INSTANT_COUPON;

    const SHIPPING_COST: i64 = 199;

    #[test]
    fn coupon_and_shipping_both_apply() {
        let mut flags = PromoFlags::new();
        flags.set_amount(PROMO_INSTANT_COUPON, 100);
        let total =
            compute_final_price(Some(1000), &flags, Some(3), false, false, false, SHIPPING_COST);
        assert_eq!(total, Some(1099));
    }

    #[test]
    fn subscription_waives_shipping() {
        let flags = PromoFlags::new();
        let total =
            compute_final_price(Some(1000), &flags, Some(5), false, true, false, SHIPPING_COST);
        assert_eq!(total, Some(1000));
    }

    #[test]
    fn included_shipping_is_not_charged_twice() {
        let flags = PromoFlags::new();
        let total =
            compute_final_price(Some(1000), &flags, Some(2), true, false, false, SHIPPING_COST);
        assert_eq!(total, Some(1000));
    }

    #[test]
    fn price_in_cart_always_yields_none() {
        let mut flags = PromoFlags::new();
        flags.set_amount(PROMO_INSTANT_COUPON, 500);
        for price in [None, Some(1), Some(10_000)] {
            let total =
                compute_final_price(price, &flags, Some(1), false, false, true, SHIPPING_COST);
            assert_eq!(total, None);
        }
    }

    #[test]
    fn missing_price_yields_none() {
        let flags = PromoFlags::new();
        assert_eq!(
            compute_final_price(None, &flags, None, false, false, false, SHIPPING_COST),
            None
        );
    }

    #[test]
    fn flag_valued_coupon_counts_as_zero() {
        let mut flags = PromoFlags::new();
        flags.set_flag(PROMO_INSTANT_COUPON, true);
        let total =
            compute_final_price(Some(500), &flags, None, false, false, false, SHIPPING_COST);
        assert_eq!(total, Some(500));
    }
}
