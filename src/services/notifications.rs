use crate::config::{EmailConfig, SecretString};
use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument};
use validator::Validate;

/// A rendered transactional email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends one message and returns the provider's message id.
    async fn send(&self, message: &EmailMessage) -> Result<String, ServiceError>;
}

/// Used when no email provider is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<String, ServiceError> {
        info!(to = %message.to_email, subject = %message.subject, "email provider not configured; message logged only");
        Ok(format!("log-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Serialize)]
struct BrevoContact<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrevoEmail<'a> {
    sender: BrevoContact<'a>,
    to: Vec<BrevoContact<'a>>,
    subject: &'a str,
    html_content: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrevoAccepted {
    message_id: Option<String>,
}

/// Brevo transactional email API.
#[derive(Clone)]
pub struct BrevoNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    sender_name: String,
    sender_email: String,
}

impl fmt::Debug for BrevoNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrevoNotifier")
            .field("base_url", &self.base_url)
            .field("sender_email", &self.sender_email)
            .finish_non_exhaustive()
    }
}

impl BrevoNotifier {
    pub fn new(client: reqwest::Client, config: &EmailConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sender_name: config.sender_name.clone(),
            sender_email: config.sender_email.clone(),
        }
    }
}

#[async_trait]
impl Notifier for BrevoNotifier {
    #[instrument(skip(self, message), fields(to = %message.to_email))]
    async fn send(&self, message: &EmailMessage) -> Result<String, ServiceError> {
        let body = BrevoEmail {
            sender: BrevoContact {
                name: &self.sender_name,
                email: &self.sender_email,
            },
            to: vec![BrevoContact {
                name: &message.to_name,
                email: &message.to_email,
            }],
            subject: &message.subject,
            html_content: &message.html,
        };

        let response = self
            .client
            .post(format!("{}/v3/smtp/email", self.base_url))
            .header("api-key", self.api_key.expose())
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::NotificationError(format!("Brevo API error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::NotificationError(format!(
                "Brevo API error: {} - {}",
                status.as_u16(),
                text
            )));
        }

        let accepted: BrevoAccepted = response
            .json()
            .await
            .map_err(|e| ServiceError::NotificationError(format!("Brevo API error: {}", e)))?;
        Ok(accepted.message_id.unwrap_or_default())
    }
}

/// Delivery notification input, in the storefront's field names.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryNotification {
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 1, max = 100))]
    pub customer_name: String,
    #[validate(length(min = 1))]
    pub order_number: String,
    #[serde(default)]
    pub product_names: Vec<String>,
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

impl DeliveryNotification {
    pub fn render(&self) -> EmailMessage {
        let products = self
            .product_names
            .iter()
            .map(|name| format!("<li>{}</li>", escape_html(name)))
            .collect::<String>();

        let html = format!(
            "<h2>Hi {name},</h2>\
             <p>Great news! Your order <strong>{number}</strong> is out for delivery and will reach you soon.</p>\
             <ul>{products}</ul>\
             <p>Please keep your phone handy so our delivery partner can reach you.</p>\
             <p>Thank you for shopping with us.</p>",
            name = escape_html(&self.customer_name),
            number = escape_html(&self.order_number),
            products = products,
        );

        EmailMessage {
            to_email: self.customer_email.clone(),
            to_name: self.customer_name.clone(),
            subject: format!("Your Order {} is Out for Delivery!", self.order_number),
            html,
        }
    }
}

/// Payment confirmation sent after a settlement commits.
pub fn order_confirmation(
    customer_name: &str,
    customer_email: &str,
    order_number: &str,
    total: &str,
) -> EmailMessage {
    EmailMessage {
        to_email: customer_email.to_string(),
        to_name: customer_name.to_string(),
        subject: format!("Order {} Confirmed", order_number),
        html: format!(
            "<h2>Hi {},</h2><p>We have received your payment of ₹{} for order <strong>{}</strong>.</p>\
             <p>We will let you know when it ships.</p>",
            escape_html(customer_name),
            escape_html(total),
            escape_html(order_number),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification() -> DeliveryNotification {
        DeliveryNotification {
            customer_email: "asha@example.com".into(),
            customer_name: "Asha <Verma>".into(),
            order_number: "ORD-1700000000000-ABCD12345".into(),
            product_names: vec!["Cordless Drill".into(), "Bit Set".into()],
        }
    }

    fn email_config(base_url: &str) -> EmailConfig {
        EmailConfig {
            api_key: "brevo-key".into(),
            base_url: base_url.into(),
            ..EmailConfig::default()
        }
    }

    #[test]
    fn renders_delivery_subject_and_escapes_html() {
        let message = notification().render();
        assert_eq!(
            message.subject,
            "Your Order ORD-1700000000000-ABCD12345 is Out for Delivery!"
        );
        assert!(message.html.contains("Asha &lt;Verma&gt;"));
        assert!(message.html.contains("<li>Cordless Drill</li>"));
    }

    #[tokio::test]
    async fn brevo_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/smtp/email"))
            .and(header("api-key", "brevo-key"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "messageId": "<msg-1@brevo>" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let notifier = BrevoNotifier::new(reqwest::Client::new(), &email_config(&server.uri()));
        let id = notifier.send(&notification().render()).await.unwrap();
        assert_eq!(id, "<msg-1@brevo>");

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["to"][0]["email"], "asha@example.com");
        assert_eq!(body["sender"]["name"], "Leadshine Marketing");
        assert!(body["htmlContent"].as_str().unwrap().contains("out for delivery"));
    }

    #[tokio::test]
    async fn brevo_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Key not found"))
            .mount(&server)
            .await;

        let notifier = BrevoNotifier::new(reqwest::Client::new(), &email_config(&server.uri()));
        let err = notifier.send(&notification().render()).await.unwrap_err();
        assert_eq!(err.to_string(), "Brevo API error: 401 - Key not found");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn brevo_debug_hides_api_key() {
        let notifier = BrevoNotifier::new(reqwest::Client::new(), &email_config("http://x"));
        assert!(!format!("{:?}", notifier).contains("brevo-key"));
    }
}
