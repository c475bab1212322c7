use super::common::{created_response, json_body};
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::cart::CartLine;
use crate::services::orders::CheckoutContact;
use crate::services::pricing;
use crate::{ApiResponse, AppState};
use axum::{
    extract::{rejection::JsonRejection, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct CartSnapshotResponse {
    pub items: Vec<CartLine>,
    pub subtotal: Decimal,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuoteRequest {
    #[serde(default, alias = "couponCode")]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    #[serde(flatten)]
    pub contact: CheckoutContact,
    #[serde(default, alias = "couponCode")]
    pub coupon_code: Option<String>,
}

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart))
        .route("/quote", post(quote))
        .route("/orders", post(create_order))
}

/// Current cart of the caller with live prices.
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<CartSnapshotResponse>>, ServiceError> {
    let items = state.services.cart.snapshot(user.user_id).await?;
    let subtotal = pricing::subtotal(&items);
    Ok(Json(ApiResponse::success(CartSnapshotResponse {
        items,
        subtotal,
    })))
}

/// Prices the caller's cart with an optional coupon. No side effects.
pub async fn quote(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<QuoteRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<pricing::PriceBreakdown>>, ServiceError> {
    let request = json_body(payload)?;
    let lines = state.services.cart.snapshot(user.user_id).await?;
    if lines.is_empty() {
        return Err(ServiceError::BadRequest("Cart is empty".to_string()));
    }
    let breakdown = state
        .services
        .pricing
        .quote(&lines, request.coupon_code.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(breakdown)))
}

/// Writes a pending order for the caller's cart.
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let request = json_body(payload)?;

    let order = state
        .services
        .orders
        .place_order(&user, &request.contact, request.coupon_code.as_deref())
        .await?;

    Ok(created_response(ApiResponse::success(order)))
}
