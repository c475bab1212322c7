use super::common::json_body;
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::gateway::{CreateGatewayOrder, GatewayOrderHandle};
use crate::services::verifier::{VerificationReceipt, VerifyPaymentRequest};
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_gateway_order))
        .route("/verify", post(verify_payment))
}

/// Creates the gateway order the hosted checkout will pay.
pub async fn create_gateway_order(
    State(state): State<AppState>,
    _user: AuthUser,
    payload: Result<Json<CreateGatewayOrder>, JsonRejection>,
) -> Result<Json<GatewayOrderHandle>, ServiceError> {
    let request = json_body(payload)?;
    let handle = state.services.gateway.create_order(request).await?;
    Ok(Json(handle))
}

/// Verifies the gateway callback and settles the order.
pub async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<VerifyPaymentRequest>, JsonRejection>,
) -> Result<Json<VerificationReceipt>, ServiceError> {
    let request = json_body(payload)?;
    let receipt = state.services.verifier.verify(&user, request).await?;
    Ok(Json(receipt))
}
