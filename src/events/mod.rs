use crate::services::notifications::{order_confirmation, Notifier};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Handle for publishing events to the in-process processor.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Queues an event without waiting; fails when the channel is full or closed.
    pub fn try_send(&self, event: Event) -> Result<(), String> {
        self.sender
            .try_send(event)
            .map_err(|e| format!("Failed to queue event: {}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A paid order committed its settlement.
    OrderConfirmed {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        customer_name: String,
        customer_email: String,
        total_amount: Decimal,
    },
}

/// Drains the event channel. Handler failures are logged and never stop the loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderConfirmed {
                order_id,
                order_number,
                customer_name,
                customer_email,
                total_amount,
                ..
            } => {
                let message = order_confirmation(
                    &customer_name,
                    &customer_email,
                    &order_number,
                    &total_amount.round_dp(2).to_string(),
                );
                match notifier.send(&message).await {
                    Ok(message_id) => {
                        info!(%order_id, %message_id, "order confirmation sent")
                    }
                    Err(e) => warn!(%order_id, error = %e, "order confirmation not sent"),
                }
            }
        }
    }

    error!("Event channel closed; event processing stopped");
}
