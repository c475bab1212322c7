//! The trust boundary between the gateway callback and settlement.

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::orders::CheckoutContact;
use crate::services::settlement::{
    SettlementLine, SettlementOutcome, SettlementRequest, SettlementService,
};
use crate::services::signature::SignatureVerifier;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Progress of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Received,
    SignatureValid,
    SignatureInvalid,
    Settled,
    SettlementFailed,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::SignatureValid => "signature_valid",
            Self::SignatureInvalid => "signature_invalid",
            Self::Settled => "settled",
            Self::SettlementFailed => "settlement_failed",
        }
    }

    pub fn can_transition_to(&self, next: VerificationState) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::SignatureValid)
                | (Self::Received, Self::SignatureInvalid)
                | (Self::SignatureValid, Self::Settled)
                | (Self::SignatureValid, Self::SettlementFailed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid | Self::Settled | Self::SettlementFailed
        )
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct VerificationRun {
    order_id: Uuid,
    state: VerificationState,
}

impl VerificationRun {
    fn start(order_id: Uuid) -> Self {
        counter!("storefront_payments.verification", 1, "state" => VerificationState::Received.as_str());
        Self {
            order_id,
            state: VerificationState::Received,
        }
    }

    fn advance(&mut self, next: VerificationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal verification transition {} -> {}",
            self.state,
            next
        );
        info!(order_id = %self.order_id, from = %self.state, to = %next, "verification state changed");
        counter!("storefront_payments.verification", 1, "state" => next.as_str());
        self.state = next;
    }
}

/// Product row as the storefront client sends it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductSnapshot {
    #[serde(default)]
    pub discount_price: Option<Decimal>,
    #[serde(default, alias = "MRP (INR)")]
    pub price: Option<Decimal>,
    #[serde(default, alias = "Material Desc")]
    pub name: Option<String>,
    /// Informational only; stock is always checked against the database
    #[serde(default, alias = "QTY")]
    pub stock_quantity: Option<i32>,
}

impl ProductSnapshot {
    pub fn unit_price(&self) -> Option<Decimal> {
        self.discount_price
            .filter(|p| *p > Decimal::ZERO)
            .or(self.price)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CartItemPayload {
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub products: Option<ProductSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentRequest {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
    pub order_id: Uuid,
    pub cart_items: Vec<CartItemPayload>,
    #[serde(default)]
    pub coupon_id: Option<Uuid>,
    /// Informational; the order's stored discount is authoritative
    #[serde(default)]
    pub discount_amount: Option<Decimal>,
    #[serde(default)]
    pub save_address: bool,
    #[serde(default)]
    pub address_data: Option<CheckoutContact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReceipt {
    pub success: bool,
    pub message: String,
    pub order_id: Uuid,
}

fn validate_payload(request: &VerifyPaymentRequest) -> Result<(), ServiceError> {
    if request.razorpay_order_id.trim().is_empty()
        || request.razorpay_payment_id.trim().is_empty()
        || request.razorpay_signature.trim().is_empty()
    {
        return Err(ServiceError::ValidationError(
            "Missing payment identifiers".to_string(),
        ));
    }
    if request.cart_items.is_empty() {
        return Err(ServiceError::ValidationError("Cart is empty".to_string()));
    }
    for item in &request.cart_items {
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Invalid quantity for product {}",
                item.product_id
            )));
        }
        if let Some(price) = item.products.as_ref().and_then(ProductSnapshot::unit_price) {
            if price.is_sign_negative() {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid price for product {}",
                    item.product_id
                )));
            }
        }
    }
    Ok(())
}

/// Verifies gateway callbacks and, only on a valid signature, settles the order.
#[derive(Clone)]
pub struct PaymentVerifier {
    signatures: SignatureVerifier,
    settlement: SettlementService,
    events: Option<EventSender>,
}

impl PaymentVerifier {
    pub fn new(
        signatures: SignatureVerifier,
        settlement: SettlementService,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            signatures,
            settlement,
            events,
        }
    }

    /// `caller` is resolved before this is reachable, so an unauthenticated
    /// request never gets as far as the signature check.
    #[instrument(
        skip(self, caller, request),
        fields(user_id = %caller.user_id, order_id = %request.order_id)
    )]
    pub async fn verify(
        &self,
        caller: &AuthUser,
        request: VerifyPaymentRequest,
    ) -> Result<VerificationReceipt, ServiceError> {
        let mut run = VerificationRun::start(request.order_id);
        validate_payload(&request)?;

        if !self.signatures.verify(
            &request.razorpay_order_id,
            &request.razorpay_payment_id,
            &request.razorpay_signature,
        ) {
            run.advance(VerificationState::SignatureInvalid);
            warn!(
                order_id = %request.order_id,
                gateway_order_id = %request.razorpay_order_id,
                gateway_payment_id = %request.razorpay_payment_id,
                "payment signature mismatch; possible tampering"
            );
            return Err(ServiceError::SignatureMismatch);
        }
        run.advance(VerificationState::SignatureValid);

        if let Some(claimed) = request.discount_amount {
            debug!(%claimed, "client-reported discount ignored in favour of stored order discount");
        }

        let save_address = if request.save_address {
            match request.address_data {
                Some(contact) => match contact.validate() {
                    Ok(()) => Some(contact),
                    Err(e) => {
                        warn!(error = %e, "address not saved: invalid address data");
                        None
                    }
                },
                None => {
                    warn!("address save requested without address data");
                    None
                }
            }
        } else {
            None
        };

        let settlement = SettlementRequest {
            order_id: request.order_id,
            user_id: caller.user_id,
            gateway_order_id: request.razorpay_order_id,
            gateway_payment_id: request.razorpay_payment_id,
            lines: request
                .cart_items
                .iter()
                .map(|item| SettlementLine {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: item.products.as_ref().and_then(ProductSnapshot::unit_price),
                })
                .collect(),
            coupon_id: request.coupon_id,
            save_address,
        };

        match self.settlement.settle(settlement).await {
            Ok(SettlementOutcome::Settled { order, .. }) => {
                run.advance(VerificationState::Settled);
                self.publish(Event::OrderConfirmed {
                    order_id: order.id,
                    order_number: order.order_number.clone(),
                    user_id: order.user_id,
                    customer_name: order.customer_name.clone(),
                    customer_email: order.customer_email.clone(),
                    total_amount: order.total_amount,
                });
                Ok(VerificationReceipt {
                    success: true,
                    message: "Payment verified successfully".to_string(),
                    order_id: order.id,
                })
            }
            Ok(SettlementOutcome::AlreadySettled { order }) => {
                run.advance(VerificationState::Settled);
                Ok(VerificationReceipt {
                    success: true,
                    message: "Payment already verified".to_string(),
                    order_id: order.id,
                })
            }
            Err(err) => {
                run.advance(VerificationState::SettlementFailed);
                Err(err.into())
            }
        }
    }

    /// Never waits on the event processor; a full channel drops the event.
    fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                warn!(error = %e, "order confirmation event dropped");
            }
        }
    }
}
