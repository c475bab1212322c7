//! Post-payment state transition.
//!
//! Every step runs in one database transaction: the order flips from
//! `pending` to `confirmed`, order items are materialized, stock is
//! decremented, the coupon is redeemed and the cart is cleared. The optional
//! address save runs in a nested savepoint so its failure never undoes a paid
//! settlement.

use crate::db::with_transaction;
use crate::entities::{
    cart_item, coupon, coupon_usage,
    order::{self, OrderStatus},
    order_item, product, saved_address,
};
use crate::errors::ServiceError;
use crate::services::orders::CheckoutContact;
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Largest difference tolerated between the order total and the re-priced cart.
const TOTAL_TOLERANCE: Decimal = dec!(0.01);

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Order not found")]
    OrderNotFound,
    #[error("Order already settled with a different payment")]
    PaidWithDifferentPayment,
    #[error("Order is {0:?} and cannot be settled")]
    NotPending(OrderStatus),
    #[error("Product {0} not found")]
    ProductNotFound(Uuid),
    #[error("Insufficient stock for {0}")]
    InsufficientStock(String),
    #[error("Order amount out of range")]
    AmountOutOfRange,
    #[error("Cart total does not match order total")]
    TotalMismatch { expected: Decimal, actual: Decimal },
    #[error("Coupon does not match order")]
    CouponMismatch,
    #[error("This coupon has reached its usage limit")]
    CouponExhausted,
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl From<SettlementError> for ServiceError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::OrderNotFound => ServiceError::NotFound(err.to_string()),
            SettlementError::PaidWithDifferentPayment | SettlementError::NotPending(_) => {
                ServiceError::Conflict(err.to_string())
            }
            SettlementError::Database(db) => ServiceError::DatabaseError(db),
            other => ServiceError::SettlementFailed(other.to_string()),
        }
    }
}

/// A purchased line as captured by the client when payment completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementLine {
    pub product_id: Uuid,
    pub quantity: i32,
    /// Snapshot price; the live product price is used when absent
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub lines: Vec<SettlementLine>,
    /// Coupon the client believes was applied; must agree with the order
    pub coupon_id: Option<Uuid>,
    pub save_address: Option<CheckoutContact>,
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Settled {
        order: order::Model,
        items: Vec<order_item::Model>,
        address_saved: bool,
    },
    /// Replay of a settlement that already committed with the same payment.
    AlreadySettled { order: order::Model },
}

#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DatabaseConnection>,
}

impl SettlementService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(
        skip(self, request),
        fields(order_id = %request.order_id, user_id = %request.user_id, lines = request.lines.len())
    )]
    pub async fn settle(
        &self,
        request: SettlementRequest,
    ) -> Result<SettlementOutcome, SettlementError> {
        let outcome = with_transaction(&self.db, |txn| {
            Box::pin(async move { apply(txn, request).await })
        })
        .await;

        match &outcome {
            Ok(SettlementOutcome::Settled { order, items, .. }) => {
                counter!("storefront_payments.settlements_committed", 1);
                info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    items = items.len(),
                    "settlement committed"
                );
            }
            Ok(SettlementOutcome::AlreadySettled { order }) => {
                counter!("storefront_payments.settlements_replayed", 1);
                info!(order_id = %order.id, "settlement replay ignored");
            }
            Err(err) => {
                counter!("storefront_payments.settlements_rolled_back", 1);
                warn!(error = %err, "settlement rolled back");
            }
        }

        outcome
    }
}

async fn apply(
    txn: &DatabaseTransaction,
    request: SettlementRequest,
) -> Result<SettlementOutcome, SettlementError> {
    let now = Utc::now();

    // 1. pending -> confirmed. The status predicate makes this the idempotency gate.
    let flipped = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(OrderStatus::Confirmed))
        .col_expr(
            order::Column::GatewayOrderId,
            Expr::value(request.gateway_order_id.clone()),
        )
        .col_expr(
            order::Column::GatewayPaymentId,
            Expr::value(request.gateway_payment_id.clone()),
        )
        .col_expr(order::Column::ConfirmedAt, Expr::value(now))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(request.order_id))
        .filter(order::Column::UserId.eq(request.user_id))
        .filter(order::Column::Status.eq(OrderStatus::Pending))
        .exec(txn)
        .await?;

    let order = order::Entity::find_by_id(request.order_id)
        .filter(order::Column::UserId.eq(request.user_id))
        .one(txn)
        .await?
        .ok_or(SettlementError::OrderNotFound)?;

    if flipped.rows_affected == 0 {
        return match order.status {
            OrderStatus::Pending => Err(SettlementError::OrderNotFound),
            _ if order.gateway_payment_id.as_deref()
                == Some(request.gateway_payment_id.as_str()) =>
            {
                Ok(SettlementOutcome::AlreadySettled { order })
            }
            OrderStatus::Cancelled => Err(SettlementError::NotPending(order.status)),
            _ if order.gateway_payment_id.is_some() => {
                Err(SettlementError::PaidWithDifferentPayment)
            }
            status => Err(SettlementError::NotPending(status)),
        };
    }

    if request.coupon_id.is_some() && request.coupon_id != order.coupon_id {
        return Err(SettlementError::CouponMismatch);
    }

    // 2 and 3. Materialize items and take stock, line by line.
    let mut items = Vec::with_capacity(request.lines.len());
    let mut items_total = Decimal::ZERO;
    for line in &request.lines {
        let product = product::Entity::find_by_id(line.product_id)
            .one(txn)
            .await?
            .ok_or(SettlementError::ProductNotFound(line.product_id))?;

        let unit_price = line.unit_price.unwrap_or_else(|| product.effective_price());
        items_total = unit_price
            .checked_mul(Decimal::from(line.quantity))
            .and_then(|line_total| items_total.checked_add(line_total))
            .ok_or(SettlementError::AmountOutOfRange)?;

        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(product.id),
            quantity: Set(line.quantity),
            price: Set(unit_price),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;
        items.push(item);

        decrement_stock(txn, &product, line.quantity).await?;
    }

    let expected = items_total
        .checked_add(order.shipping_amount)
        .and_then(|total| total.checked_sub(order.discount_amount))
        .ok_or(SettlementError::AmountOutOfRange)?
        .max(Decimal::ZERO);
    if (expected - order.total_amount).abs() > TOTAL_TOLERANCE {
        return Err(SettlementError::TotalMismatch {
            expected: order.total_amount,
            actual: expected,
        });
    }

    // 4. Best-effort address save inside its own savepoint.
    let address_saved = match &request.save_address {
        Some(contact) => match save_address(txn, request.user_id, contact).await {
            Ok(()) => true,
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "address save failed; continuing settlement");
                false
            }
        },
        None => false,
    };

    // 5. Coupon redemption, counted once per order.
    if let Some(coupon_id) = order.coupon_id {
        if order.discount_amount > Decimal::ZERO {
            redeem_coupon(txn, coupon_id, &order).await?;
        }
    }

    // 6. The cart has been consumed.
    cart_item::Entity::delete_many()
        .filter(cart_item::Column::UserId.eq(request.user_id))
        .exec(txn)
        .await?;

    let order = order::Entity::find_by_id(order.id)
        .one(txn)
        .await?
        .ok_or(SettlementError::OrderNotFound)?;

    Ok(SettlementOutcome::Settled {
        order,
        items,
        address_saved,
    })
}

/// `stock = stock - n WHERE stock >= n`; zero rows means not enough stock.
async fn decrement_stock(
    txn: &DatabaseTransaction,
    product: &product::Model,
    quantity: i32,
) -> Result<(), SettlementError> {
    let result = product::Entity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product.id))
        .filter(product::Column::StockQuantity.gte(quantity))
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        return Err(SettlementError::InsufficientStock(product.name.clone()));
    }
    Ok(())
}

/// `current_uses + 1` guarded by the cap, plus the ledger row.
async fn redeem_coupon(
    txn: &DatabaseTransaction,
    coupon_id: Uuid,
    order: &order::Model,
) -> Result<(), SettlementError> {
    let result = coupon::Entity::update_many()
        .col_expr(
            coupon::Column::CurrentUses,
            Expr::col(coupon::Column::CurrentUses).add(1),
        )
        .filter(coupon::Column::Id.eq(coupon_id))
        .filter(
            Condition::any()
                .add(coupon::Column::MaxUses.is_null())
                .add(Expr::col(coupon::Column::CurrentUses).lt(Expr::col(coupon::Column::MaxUses))),
        )
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        return Err(SettlementError::CouponExhausted);
    }

    coupon_usage::ActiveModel {
        id: Set(Uuid::new_v4()),
        coupon_id: Set(coupon_id),
        user_id: Set(order.user_id),
        order_id: Set(order.id),
        discount_amount: Set(order.discount_amount),
        used_at: Set(Utc::now()),
    }
    .insert(txn)
    .await?;

    Ok(())
}

async fn save_address(
    txn: &DatabaseTransaction,
    user_id: Uuid,
    contact: &CheckoutContact,
) -> Result<(), DbErr> {
    let savepoint = txn.begin().await?;

    let result = async {
        let existing = saved_address::Entity::find()
            .filter(saved_address::Column::UserId.eq(user_id))
            .count(&savepoint)
            .await?;

        saved_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            full_name: Set(contact.full_name.trim().to_string()),
            email: Set(contact.email.trim().to_string()),
            phone: Set(contact.phone.trim().to_string()),
            address: Set(contact.address.trim().to_string()),
            city: Set(contact.city.trim().to_string()),
            state: Set(contact.state.trim().to_string()),
            zip_code: Set(contact.pincode.trim().to_string()),
            is_default: Set(existing == 0),
            created_at: Set(Utc::now()),
        }
        .insert(&savepoint)
        .await
        .map(|_| ())
    }
    .await;

    match result {
        Ok(()) => savepoint.commit().await,
        Err(err) => {
            savepoint.rollback().await?;
            Err(err)
        }
    }
}
