use crate::auth::AuthUser;
use crate::entities::order::{self, OrderStatus};
use crate::errors::ServiceError;
use crate::services::cart::CartService;
use crate::services::pricing::{PriceBreakdown, PricingService};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SEQUENCE_CHARS: usize = 4;
const RANDOM_CHARS: usize = 5;

/// Generates order numbers shaped `ORD-<unix millis>-<9 base36 chars>`.
///
/// The suffix is a 4-char rolling sequence followed by 5 random chars, so two
/// numbers minted by one process in the same millisecond never collide.
#[derive(Debug, Default)]
pub struct OrderNumberGenerator {
    sequence: AtomicU64,
}

impl OrderNumberGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let millis = Utc::now().timestamp_millis();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut suffix = String::with_capacity(SEQUENCE_CHARS + RANDOM_CHARS);
        let mut rest = seq % 36u64.pow(SEQUENCE_CHARS as u32);
        let mut seq_chars = [b'0'; SEQUENCE_CHARS];
        for slot in seq_chars.iter_mut().rev() {
            *slot = BASE36[(rest % 36) as usize];
            rest /= 36;
        }
        suffix.extend(seq_chars.iter().map(|&b| b as char));

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_CHARS {
            suffix.push(BASE36[rng.gen_range(0..36)] as char);
        }

        format!("ORD-{}-{}", millis, suffix)
    }
}

/// Buyer contact and shipping destination captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutContact {
    #[validate(length(min = 1, max = 100, message = "Full name is required"))]
    pub full_name: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: String,
    #[validate(length(min = 10, max = 15, message = "Phone number must be 10-15 digits"))]
    pub phone: String,
    #[validate(length(min = 10, max = 500, message = "Please enter a complete address"))]
    pub address: String,
    #[validate(length(min = 1, max = 100, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, max = 100, message = "State is required"))]
    pub state: String,
    #[validate(length(equal = 6, message = "Pincode must be 6 digits"))]
    pub pincode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

/// Identity and totals of a freshly written pending order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub order_id: Uuid,
    pub order_number: String,
    pub subtotal: Decimal,
    pub shipping_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
}

impl From<&order::Model> for PendingOrder {
    fn from(model: &order::Model) -> Self {
        Self {
            order_id: model.id,
            order_number: model.order_number.clone(),
            subtotal: model.subtotal,
            shipping_amount: model.shipping_amount,
            discount_amount: model.discount_amount,
            total_amount: model.total_amount,
            currency: model.currency.clone(),
        }
    }
}

/// Writes `pending` orders before any payment attempt.
#[derive(Clone)]
pub struct OrderIntentService {
    db: Arc<DatabaseConnection>,
    cart: CartService,
    pricing: PricingService,
    numbers: Arc<OrderNumberGenerator>,
    currency: String,
}

impl OrderIntentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        cart: CartService,
        pricing: PricingService,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            cart,
            pricing,
            numbers: Arc::new(OrderNumberGenerator::new()),
            currency: currency.into(),
        }
    }

    /// Prices the caller's server-side cart and writes the pending order.
    #[instrument(skip(self, contact), fields(user_id = %user.user_id))]
    pub async fn place_order(
        &self,
        user: &AuthUser,
        contact: &CheckoutContact,
        coupon_code: Option<&str>,
    ) -> Result<PendingOrder, ServiceError> {
        contact.validate()?;

        let lines = self.cart.snapshot(user.user_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::BadRequest("Cart is empty".to_string()));
        }

        let breakdown = self.pricing.quote(&lines, coupon_code).await?;
        self.write_pending_order(user.user_id, contact, &breakdown)
            .await
    }

    /// Creates exactly one `pending` order row from validated contact fields
    /// and computed totals. Persistence errors are returned as-is.
    pub async fn write_pending_order(
        &self,
        user_id: Uuid,
        contact: &CheckoutContact,
        breakdown: &PriceBreakdown,
    ) -> Result<PendingOrder, ServiceError> {
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(self.numbers.next()),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending),
            subtotal: Set(breakdown.subtotal),
            shipping_amount: Set(breakdown.shipping_fee),
            discount_amount: Set(breakdown.discount),
            total_amount: Set(breakdown.total),
            currency: Set(self.currency.clone()),
            coupon_id: Set(breakdown.coupon.as_ref().map(|c| c.coupon_id)),
            customer_name: Set(contact.full_name.trim().to_string()),
            customer_email: Set(contact.email.trim().to_string()),
            customer_phone: Set(contact.phone.trim().to_string()),
            shipping_address: Set(contact.address.trim().to_string()),
            shipping_city: Set(contact.city.trim().to_string()),
            shipping_state: Set(contact.state.trim().to_string()),
            shipping_pincode: Set(contact.pincode.trim().to_string()),
            notes: Set(contact.notes.clone().filter(|n| !n.trim().is_empty())),
            gateway_order_id: Set(None),
            gateway_payment_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            confirmed_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            "pending order created"
        );

        Ok(PendingOrder::from(&order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn contact() -> CheckoutContact {
        CheckoutContact {
            full_name: "Asha Verma".into(),
            email: "asha@example.com".into(),
            phone: "9876543210".into(),
            address: "12 MG Road, Indiranagar".into(),
            city: "Bengaluru".into(),
            state: "Karnataka".into(),
            pincode: "560038".into(),
            notes: None,
        }
    }

    #[test]
    fn order_numbers_are_unique_under_rapid_generation() {
        let generator = OrderNumberGenerator::new();
        let mut seen = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            assert!(seen.insert(generator.next()));
        }
    }

    #[test]
    fn order_number_format() {
        let number = OrderNumberGenerator::new().next();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn contact_validation_matches_checkout_form() {
        assert!(contact().validate().is_ok());

        let mut short_pin = contact();
        short_pin.pincode = "5600".into();
        assert!(short_pin.validate().is_err());

        let mut short_phone = contact();
        short_phone.phone = "12345".into();
        assert!(short_phone.validate().is_err());

        let mut short_address = contact();
        short_address.address = "MG Road".into();
        assert!(short_address.validate().is_err());

        let mut bad_email = contact();
        bad_email.email = "not-an-email".into();
        assert!(bad_email.validate().is_err());
    }

    #[test]
    fn contact_uses_storefront_field_names() {
        let json = serde_json::json!({
            "fullName": "Asha Verma",
            "email": "asha@example.com",
            "phone": "9876543210",
            "address": "12 MG Road, Indiranagar",
            "city": "Bengaluru",
            "state": "Karnataka",
            "pincode": "560038"
        });
        let parsed: CheckoutContact = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, contact());
    }
}
