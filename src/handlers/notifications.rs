use super::common::{json_body, validate_input};
use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::notifications::DeliveryNotification;
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSent {
    pub success: bool,
    pub message_id: String,
}

pub fn notification_routes() -> Router<AppState> {
    Router::new().route("/delivery", post(send_delivery_notification))
}

/// Emails the buyer that their order is out for delivery.
pub async fn send_delivery_notification(
    State(state): State<AppState>,
    user: AuthUser,
    payload: Result<Json<DeliveryNotification>, JsonRejection>,
) -> Result<Json<NotificationSent>, ServiceError> {
    let notification = json_body(payload)?;
    validate_input(&notification)?;

    let message_id = state
        .services
        .notifier
        .send(&notification.render())
        .await?;

    info!(
        requested_by = %user.user_id,
        order_number = %notification.order_number,
        %message_id,
        "delivery notification sent"
    );

    Ok(Json(NotificationSent {
        success: true,
        message_id,
    }))
}
