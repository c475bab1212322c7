use crate::config::ShippingConfig;
use crate::entities::coupon::{self, DiscountType};
use crate::errors::ServiceError;
use crate::services::cart::CartLine;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Why a coupon was not applied. No partial discount is ever granted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponRejection {
    #[error("Invalid coupon code")]
    NotFound,
    #[error("This coupon has expired or is not yet valid")]
    OutsideValidityWindow,
    #[error("This coupon has reached its usage limit")]
    UsageLimitReached,
    #[error("Minimum purchase amount of ₹{0} required")]
    MinimumPurchaseNotMet(Decimal),
}

/// Flat fee up to and including the threshold, free above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingPolicy {
    pub free_shipping_threshold: Decimal,
    pub flat_fee: Decimal,
}

impl ShippingPolicy {
    pub fn fee_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.flat_fee
        }
    }
}

impl From<&ShippingConfig> for ShippingPolicy {
    fn from(cfg: &ShippingConfig) -> Self {
        Self {
            free_shipping_threshold: cfg.free_shipping_threshold,
            flat_fee: cfg.flat_shipping_fee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub coupon: Option<AppliedCoupon>,
}

fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn subtotal(lines: &[CartLine]) -> Decimal {
    lines.iter().map(CartLine::line_total).sum()
}

/// Checks, in order: active, validity window, usage cap, minimum purchase.
pub fn check_coupon(
    coupon: &coupon::Model,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> Result<(), CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::NotFound);
    }
    if !coupon.is_within_window(now) {
        return Err(CouponRejection::OutsideValidityWindow);
    }
    if coupon.usage_exhausted() {
        return Err(CouponRejection::UsageLimitReached);
    }
    if let Some(min) = coupon.min_purchase_amount {
        if subtotal < min {
            return Err(CouponRejection::MinimumPurchaseNotMet(min.normalize()));
        }
    }
    Ok(())
}

/// Percentage discounts are capped by `max_discount_amount`; fixed discounts
/// never exceed the subtotal.
pub fn discount_for(coupon: &coupon::Model, subtotal: Decimal) -> Decimal {
    let raw = match coupon.discount_type {
        DiscountType::Percentage => {
            let pct = subtotal * coupon.discount_value / Decimal::ONE_HUNDRED;
            match coupon.max_discount_amount {
                Some(cap) => pct.min(cap),
                None => pct,
            }
        }
        DiscountType::Fixed => coupon.discount_value.min(subtotal),
    };
    money(raw.max(Decimal::ZERO))
}

/// Prices a cart. `coupon` is the record matched for the buyer's code, if any.
pub fn evaluate(
    lines: &[CartLine],
    coupon: Option<&coupon::Model>,
    now: DateTime<Utc>,
    policy: &ShippingPolicy,
) -> Result<PriceBreakdown, CouponRejection> {
    let subtotal = money(subtotal(lines));
    let shipping_fee = policy.fee_for(subtotal);

    let (discount, applied) = match coupon {
        Some(coupon) => {
            check_coupon(coupon, subtotal, now)?;
            (
                discount_for(coupon, subtotal),
                Some(AppliedCoupon {
                    coupon_id: coupon.id,
                    code: coupon.code.clone(),
                }),
            )
        }
        None => (Decimal::ZERO, None),
    };

    let total = (subtotal + shipping_fee - discount).max(Decimal::ZERO);

    Ok(PriceBreakdown {
        subtotal,
        shipping_fee,
        discount,
        total,
        coupon: applied,
    })
}

pub fn normalize_coupon_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Pricing with the one coupon lookup it needs.
#[derive(Clone)]
pub struct PricingService {
    db: Arc<DatabaseConnection>,
    policy: ShippingPolicy,
}

impl PricingService {
    pub fn new(db: Arc<DatabaseConnection>, policy: ShippingPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &ShippingPolicy {
        &self.policy
    }

    /// Finds an active coupon by code, case-insensitively.
    pub async fn find_coupon(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        let code = normalize_coupon_code(code);
        if code.is_empty() {
            return Ok(None);
        }
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code))
            .filter(coupon::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?)
    }

    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn quote(
        &self,
        lines: &[CartLine],
        coupon_code: Option<&str>,
    ) -> Result<PriceBreakdown, ServiceError> {
        let coupon = match coupon_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => Some(
                self.find_coupon(code)
                    .await?
                    .ok_or(CouponRejection::NotFound)?,
            ),
            None => None,
        };

        let breakdown = evaluate(lines, coupon.as_ref(), Utc::now(), &self.policy)?;
        debug!(
            subtotal = %breakdown.subtotal,
            discount = %breakdown.discount,
            total = %breakdown.total,
            "priced cart"
        );
        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn policy(threshold: Decimal) -> ShippingPolicy {
        ShippingPolicy {
            free_shipping_threshold: threshold,
            flat_fee: dec!(50),
        }
    }

    fn line(price: Decimal, quantity: i32) -> CartLine {
        CartLine {
            product_id: Uuid::new_v4(),
            product_name: "Angle Grinder".into(),
            quantity,
            unit_price: price,
        }
    }

    fn coupon(discount_type: DiscountType, value: Decimal) -> coupon::Model {
        let now = Utc::now();
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".into(),
            description: None,
            discount_type,
            discount_value: value,
            max_discount_amount: None,
            min_purchase_amount: None,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
            max_uses: None,
            current_uses: 0,
            is_active: true,
            created_at: now,
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let mut c = coupon(DiscountType::Percentage, dec!(10));
        c.max_discount_amount = Some(dec!(80));

        let quote = evaluate(&[line(dec!(1000), 1)], Some(&c), Utc::now(), &policy(dec!(500)))
            .unwrap();

        assert_eq!(quote.subtotal, dec!(1000));
        assert_eq!(quote.discount, dec!(80));
        assert_eq!(quote.shipping_fee, dec!(0));
        assert_eq!(quote.total, dec!(920));
        assert_eq!(quote.coupon.unwrap().coupon_id, c.id);
    }

    #[test]
    fn flat_shipping_below_threshold() {
        let lines = [line(dec!(250), 2), line(dec!(300), 1)];
        let quote = evaluate(&lines, None, Utc::now(), &policy(dec!(1000))).unwrap();
        assert_eq!(quote.subtotal, dec!(800));
        assert_eq!(quote.shipping_fee, dec!(50));
        assert_eq!(quote.total, dec!(850));
    }

    #[test]
    fn shipping_is_charged_at_the_threshold_and_free_above() {
        let at = evaluate(&[line(dec!(500), 1)], None, Utc::now(), &policy(dec!(500))).unwrap();
        assert_eq!(at.shipping_fee, dec!(50));
        assert_eq!(at.total, dec!(550));

        let above =
            evaluate(&[line(dec!(500.01), 1)], None, Utc::now(), &policy(dec!(500))).unwrap();
        assert_eq!(above.shipping_fee, Decimal::ZERO);
    }

    #[test]
    fn fixed_discount_clamped_to_subtotal_and_total_floored() {
        let c = coupon(DiscountType::Fixed, dec!(500));
        let quote =
            evaluate(&[line(dec!(120), 1)], Some(&c), Utc::now(), &policy(dec!(100))).unwrap();
        assert_eq!(quote.discount, dec!(120));
        assert_eq!(quote.total, Decimal::ZERO);
    }

    #[test]
    fn rejections_follow_check_order() {
        let now = Utc::now();
        let lines = [line(dec!(100), 1)];
        let p = policy(dec!(500));

        let mut inactive = coupon(DiscountType::Fixed, dec!(10));
        inactive.is_active = false;
        inactive.current_uses = 5;
        inactive.max_uses = Some(5);
        assert_eq!(
            evaluate(&lines, Some(&inactive), now, &p).unwrap_err(),
            CouponRejection::NotFound
        );

        let mut expired = coupon(DiscountType::Fixed, dec!(10));
        expired.valid_until = now - Duration::hours(1);
        expired.max_uses = Some(1);
        expired.current_uses = 1;
        assert_eq!(
            evaluate(&lines, Some(&expired), now, &p).unwrap_err(),
            CouponRejection::OutsideValidityWindow
        );

        let mut capped = coupon(DiscountType::Fixed, dec!(10));
        capped.max_uses = Some(3);
        capped.current_uses = 3;
        capped.min_purchase_amount = Some(dec!(1000));
        let err = evaluate(&lines, Some(&capped), now, &p).unwrap_err();
        assert_eq!(err, CouponRejection::UsageLimitReached);
        assert_eq!(err.to_string(), "This coupon has reached its usage limit");

        let mut minimum = coupon(DiscountType::Fixed, dec!(10));
        minimum.min_purchase_amount = Some(dec!(1000.0000));
        let err = evaluate(&lines, Some(&minimum), now, &p).unwrap_err();
        assert_eq!(err.to_string(), "Minimum purchase amount of ₹1000 required");
    }

    #[test]
    fn not_yet_valid_coupon_is_rejected() {
        let now = Utc::now();
        let mut c = coupon(DiscountType::Percentage, dec!(5));
        c.valid_from = now + Duration::days(2);
        assert_eq!(
            check_coupon(&c, dec!(100), now).unwrap_err(),
            CouponRejection::OutsideValidityWindow
        );
    }

    #[test]
    fn percentage_discount_rounds_to_paise() {
        let c = coupon(DiscountType::Percentage, dec!(7.5));
        assert_eq!(discount_for(&c, dec!(333.33)), dec!(25.00));
    }

    #[test]
    fn coupon_codes_are_upper_cased() {
        assert_eq!(normalize_coupon_code("  save10 "), "SAVE10");
    }
}
