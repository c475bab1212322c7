use crate::entities::{cart_item, product};
use crate::errors::ServiceError;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// One priced cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    /// Discount price when set, list price otherwise
    pub unit_price: Decimal,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Reads the buyer's current cart joined with live product prices.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn snapshot(&self, user_id: Uuid) -> Result<Vec<CartLine>, ServiceError> {
        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .find_also_related(product::Entity)
            .all(&*self.db)
            .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for (item, product) in rows {
            match product {
                Some(product) => lines.push(CartLine {
                    product_id: product.id,
                    product_name: product.name.clone(),
                    quantity: item.quantity,
                    unit_price: product.effective_price(),
                }),
                None => warn!(
                    cart_item_id = %item.id,
                    product_id = %item.product_id,
                    "cart item references a missing product; skipping"
                ),
            }
        }

        Ok(lines)
    }
}
