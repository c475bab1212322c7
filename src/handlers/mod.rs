pub mod checkout;
pub mod common;
pub mod notifications;
pub mod payments;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::{
    cart::CartService,
    gateway::{GatewayOrderBridge, PaymentGateway, RazorpayGateway},
    notifications::{BrevoNotifier, LogNotifier, Notifier},
    orders::OrderIntentService,
    pricing::{PricingService, ShippingPolicy},
    settlement::SettlementService,
    signature::SignatureVerifier,
    verifier::PaymentVerifier,
};
use std::sync::Arc;
use tracing::warn;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub pricing: Arc<PricingService>,
    pub orders: Arc<OrderIntentService>,
    pub gateway: Arc<GatewayOrderBridge>,
    pub verifier: Arc<PaymentVerifier>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppServices {
    /// Wires the services around explicit gateway and notifier implementations.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        event_sender: EventSender,
    ) -> Self {
        let cart = CartService::new(db_pool.clone());
        let pricing = PricingService::new(db_pool.clone(), ShippingPolicy::from(&config.shipping));
        let orders = OrderIntentService::new(
            db_pool.clone(),
            cart.clone(),
            pricing.clone(),
            config.gateway.default_currency.clone(),
        );
        let bridge = GatewayOrderBridge::new(gateway, config.gateway.default_currency.clone());
        let verifier = PaymentVerifier::new(
            SignatureVerifier::new(config.gateway.key_secret.clone()),
            SettlementService::new(db_pool),
            Some(event_sender),
        );

        Self {
            cart: Arc::new(cart),
            pricing: Arc::new(pricing),
            orders: Arc::new(orders),
            gateway: Arc::new(bridge),
            verifier: Arc::new(verifier),
            notifier,
        }
    }

    /// Builds the production gateway and email clients from configuration.
    pub fn from_config(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        http: reqwest::Client,
        event_sender: EventSender,
    ) -> Self {
        if !config.gateway.is_configured() {
            warn!("Payment gateway credentials are not configured; gateway calls and signature checks will fail");
        }
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(RazorpayGateway::new(http.clone(), &config.gateway));
        Self::new(
            db_pool,
            config,
            gateway,
            notifier_from_config(config, http),
            event_sender,
        )
    }
}

/// Brevo when an API key is configured, log-only otherwise.
pub fn notifier_from_config(config: &AppConfig, http: reqwest::Client) -> Arc<dyn Notifier> {
    if config.email.is_configured() {
        Arc::new(BrevoNotifier::new(http, &config.email))
    } else {
        warn!("Email provider is not configured; notifications will only be logged");
        Arc::new(LogNotifier)
    }
}
