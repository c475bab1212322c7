use crate::config::{GatewayConfig, SecretString};
use crate::errors::ServiceError;
use async_trait::async_trait;
use metrics::counter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument};

const FALLBACK_GATEWAY_ERROR: &str = "Failed to create payment order";

/// Order-creation call sent to the payment gateway. Amount is in minor units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayOrderRequest {
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: Map<String, Value>,
}

/// Gateway's view of a created order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: &GatewayOrderRequest)
        -> Result<GatewayOrder, ServiceError>;
}

#[derive(Deserialize)]
struct GatewayErrorBody {
    error: Option<GatewayErrorDetail>,
}

#[derive(Deserialize)]
struct GatewayErrorDetail {
    description: Option<String>,
}

/// Razorpay Orders API client.
#[derive(Clone)]
pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: SecretString,
}

impl fmt::Debug for RazorpayGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RazorpayGateway")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RazorpayGateway {
    pub fn new(client: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    #[instrument(skip(self, request), fields(receipt = %request.receipt, amount = request.amount))]
    async fn create_order(
        &self,
        request: &GatewayOrderRequest,
    ) -> Result<GatewayOrder, ServiceError> {
        let response = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(self.key_secret.expose()))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "payment gateway unreachable");
                ServiceError::GatewayError(FALLBACK_GATEWAY_ERROR.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let description = response
                .json::<GatewayErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .and_then(|detail| detail.description)
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| FALLBACK_GATEWAY_ERROR.to_string());
            error!(status = status.as_u16(), %description, "payment gateway rejected order");
            return Err(ServiceError::GatewayError(description));
        }

        response.json::<GatewayOrder>().await.map_err(|e| {
            error!(error = %e, "unreadable payment gateway response");
            ServiceError::GatewayError(FALLBACK_GATEWAY_ERROR.to_string())
        })
    }
}

/// Bridge input. Amount is in major units (rupees).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGatewayOrder {
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    pub receipt: String,
    #[serde(default)]
    pub notes: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrderHandle {
    pub order_id: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
}

/// Converts major units to minor units, rounding half away from zero.
/// `None` when the amount does not fit.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Creates the gateway order that the hosted checkout pays against.
#[derive(Clone)]
pub struct GatewayOrderBridge {
    gateway: Arc<dyn PaymentGateway>,
    default_currency: String,
}

impl GatewayOrderBridge {
    pub fn new(gateway: Arc<dyn PaymentGateway>, default_currency: impl Into<String>) -> Self {
        Self {
            gateway,
            default_currency: default_currency.into(),
        }
    }

    #[instrument(skip(self, input), fields(receipt = %input.receipt))]
    pub async fn create_order(
        &self,
        input: CreateGatewayOrder,
    ) -> Result<GatewayOrderHandle, ServiceError> {
        if input.amount <= Decimal::ZERO {
            return Err(ServiceError::BadRequest("Invalid amount".to_string()));
        }
        let amount = to_minor_units(input.amount)
            .filter(|minor| *minor > 0)
            .ok_or_else(|| ServiceError::BadRequest("Invalid amount".to_string()))?;

        let request = GatewayOrderRequest {
            amount,
            currency: input
                .currency
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| self.default_currency.clone()),
            receipt: input.receipt,
            notes: input.notes.unwrap_or_default(),
        };

        let order = match self.gateway.create_order(&request).await {
            Ok(order) => order,
            Err(err) => {
                counter!("storefront_payments.gateway_orders_failed", 1);
                return Err(err);
            }
        };

        counter!("storefront_payments.gateway_orders_created", 1);
        info!(gateway_order_id = %order.id, amount = order.amount, "gateway order created");

        Ok(GatewayOrderHandle {
            order_id: order.id,
            amount: order.amount,
            currency: order.currency,
            receipt: order.receipt.unwrap_or(request.receipt),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> GatewayConfig {
        GatewayConfig {
            key_id: "rzp_test_key".into(),
            key_secret: "rzp_test_secret".into(),
            base_url: base_url.into(),
            default_currency: "INR".into(),
        }
    }

    fn bridge(server: &MockServer) -> GatewayOrderBridge {
        let gateway = RazorpayGateway::new(reqwest::Client::new(), &config(&server.uri()));
        GatewayOrderBridge::new(Arc::new(gateway), "INR")
    }

    #[test]
    fn minor_units_round_half_up() {
        assert_eq!(to_minor_units(dec!(850)), Some(85_000));
        assert_eq!(to_minor_units(dec!(10.005)), Some(1_001));
        assert_eq!(to_minor_units(dec!(99.994)), Some(9_999));
    }

    #[test]
    fn minor_units_overflow_is_none() {
        assert_eq!(to_minor_units(Decimal::MAX), None);
        assert_eq!(to_minor_units(Decimal::from(i64::MAX)), None);
    }

    #[test]
    fn debug_output_hides_secret() {
        let gateway = RazorpayGateway::new(reqwest::Client::new(), &config("http://localhost"));
        assert!(!format!("{:?}", gateway).contains("rzp_test_secret"));
    }

    #[tokio::test]
    async fn creates_order_with_basic_auth_and_minor_units() {
        let server = MockServer::start().await;
        // base64("rzp_test_key:rzp_test_secret")
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(header(
                "authorization",
                "Basic cnpwX3Rlc3Rfa2V5OnJ6cF90ZXN0X3NlY3JldA==",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "order_Nx1",
                "amount": 85000,
                "currency": "INR",
                "receipt": "ORD-1-ABC"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let handle = bridge(&server)
            .create_order(CreateGatewayOrder {
                amount: dec!(850),
                currency: None,
                receipt: "ORD-1-ABC".into(),
                notes: None,
            })
            .await
            .unwrap();

        assert_eq!(handle.order_id, "order_Nx1");
        assert_eq!(handle.amount, 85_000);
        assert_eq!(handle.currency, "INR");

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["amount"], 85_000);
        assert_eq!(body["receipt"], "ORD-1-ABC");
    }

    #[tokio::test]
    async fn rejects_non_positive_amount_without_calling_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = bridge(&server)
            .create_order(CreateGatewayOrder {
                amount: dec!(0),
                currency: None,
                receipt: "ORD-1-ABC".into(),
                notes: None,
            })
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::BadRequest(ref m) if m == "Invalid amount");

        let err = bridge(&server)
            .create_order(CreateGatewayOrder {
                amount: Decimal::MAX,
                currency: None,
                receipt: "ORD-1-ABC".into(),
                notes: None,
            })
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::BadRequest(ref m) if m == "Invalid amount");
    }

    #[tokio::test]
    async fn surfaces_gateway_error_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": "BAD_REQUEST_ERROR", "description": "Authentication failed" }
            })))
            .mount(&server)
            .await;

        let err = bridge(&server)
            .create_order(CreateGatewayOrder {
                amount: dec!(10),
                currency: Some("INR".into()),
                receipt: "ORD-2-XYZ".into(),
                notes: None,
            })
            .await
            .unwrap_err();

        assert_matches!(err, ServiceError::GatewayError(ref m) if m == "Authentication failed");
    }

    #[tokio::test]
    async fn falls_back_when_gateway_error_has_no_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = bridge(&server)
            .create_order(CreateGatewayOrder {
                amount: dec!(10),
                currency: None,
                receipt: "ORD-3".into(),
                notes: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to create payment order");
    }
}
