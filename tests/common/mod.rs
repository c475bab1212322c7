#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{Claims, IdentityProvider, JwtIdentityProvider},
    config::{AppConfig, SecretString},
    db,
    entities::{
        cart_item, coupon,
        coupon::DiscountType,
        order, order_item, product, saved_address,
    },
    events::{self, EventSender},
    handlers::{notifier_from_config, AppServices},
    services::signature::SignatureVerifier,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "storefront_identity_secret_for_integration_tests";
pub const GATEWAY_KEY_ID: &str = "rzp_test_key";
pub const GATEWAY_SECRET: &str = "rzp_test_secret";

/// Application state backed by an in-memory SQLite database, with the router
/// driven in-process.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub user_id: Uuid,
    token: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration,
    /// e.g. to point the gateway or email provider at a mock server.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.gateway.key_id = GATEWAY_KEY_ID.to_string();
        cfg.gateway.key_secret = SecretString::new(GATEWAY_SECRET);
        cfg.gateway.base_url = "http://127.0.0.1:9".to_string();
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let http = reqwest::Client::new();
        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(
            event_rx,
            notifier_from_config(&cfg, http.clone()),
        ));

        let services = AppServices::from_config(db_arc.clone(), &cfg, http, event_sender.clone());
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(JwtIdentityProvider::from_config(&cfg));

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
            identity,
            event_sender,
        };

        let user_id = Uuid::new_v4();
        Self {
            router: storefront_api::build_router(state.clone()),
            state,
            user_id,
            token: token_for(user_id),
            _event_task: event_task,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router response")
    }

    pub async fn request_authenticated(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        self.request(method, uri, body, Some(&self.token)).await
    }

    pub async fn seed_product(
        &self,
        name: &str,
        price: Decimal,
        discount_price: Option<Decimal>,
        stock: i32,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            discount_price: Set(discount_price),
            stock_quantity: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert product")
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert cart item");
    }

    pub async fn seed_coupon(&self, seed: CouponSeed) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(seed.code.to_uppercase()),
            description: Set(None),
            discount_type: Set(seed.discount_type),
            discount_value: Set(seed.discount_value),
            max_discount_amount: Set(seed.max_discount_amount),
            min_purchase_amount: Set(seed.min_purchase_amount),
            valid_from: Set(now - Duration::days(1)),
            valid_until: Set(now + Duration::days(seed.valid_days)),
            max_uses: Set(seed.max_uses),
            current_uses: Set(seed.current_uses),
            is_active: Set(true),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert coupon")
    }

    /// Places a pending order for the default user through the checkout endpoint.
    pub async fn place_order(&self, coupon_code: Option<&str>) -> Value {
        let mut body = contact_json();
        if let Some(code) = coupon_code {
            body["coupon_code"] = json!(code);
        }
        let response = self
            .request_authenticated(Method::POST, "/api/v1/checkout/orders", Some(body))
            .await;
        assert_eq!(response.status(), 201, "placing order failed");
        response_json(response).await["data"].clone()
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn coupon(&self, id: Uuid) -> coupon::Model {
        coupon::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load coupon")
            .expect("coupon exists")
    }

    pub async fn order_items(&self, order_id: Uuid) -> Vec<order_item::Model> {
        order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.state.db)
            .await
            .expect("load order items")
    }

    pub async fn cart_len(&self, user_id: Uuid) -> u64 {
        cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .count(&*self.state.db)
            .await
            .expect("count cart items")
    }

    pub async fn saved_addresses(&self, user_id: Uuid) -> Vec<saved_address::Model> {
        saved_address::Entity::find()
            .filter(saved_address::Column::UserId.eq(user_id))
            .all(&*self.state.db)
            .await
            .expect("load saved addresses")
    }
}

pub struct CouponSeed {
    pub code: &'static str,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub min_purchase_amount: Option<Decimal>,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    pub valid_days: i64,
}

impl Default for CouponSeed {
    fn default() -> Self {
        Self {
            code: "SAVE10",
            discount_type: DiscountType::Percentage,
            discount_value: dec!(10),
            max_discount_amount: None,
            min_purchase_amount: None,
            max_uses: None,
            current_uses: 0,
            valid_days: 30,
        }
    }
}

pub fn token_for(user_id: Uuid) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        email: Some("buyer@example.com".to_string()),
        role: Some("authenticated".to_string()),
        exp: now + 3600,
        iat: Some(now),
        iss: None,
        aud: None,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("sign test token")
}

pub fn sign(gateway_order_id: &str, payment_id: &str) -> String {
    SignatureVerifier::new(SecretString::new(GATEWAY_SECRET)).sign(gateway_order_id, payment_id)
}

pub fn contact_json() -> Value {
    json!({
        "fullName": "Asha Verma",
        "email": "asha@example.com",
        "phone": "9876543210",
        "address": "14 MG Road, Indiranagar",
        "city": "Bengaluru",
        "state": "Karnataka",
        "pincode": "560038"
    })
}

/// Cart line in the shape the storefront posts to the verifier.
pub fn cart_line(product: &product::Model, quantity: i32) -> Value {
    json!({
        "product_id": product.id,
        "quantity": quantity,
        "products": {
            "Material Desc": product.name,
            "MRP (INR)": product.price.to_string(),
            "discount_price": product.discount_price.map(|p| p.to_string()),
            "QTY": product.stock_quantity
        }
    })
}

/// A correctly signed verification payload.
pub fn verify_payload(order_id: &str, payment_id: &str, cart_items: Vec<Value>) -> Value {
    let gateway_order_id = format!("order_{}", &order_id[..8]);
    json!({
        "razorpay_order_id": gateway_order_id,
        "razorpay_payment_id": payment_id,
        "razorpay_signature": sign(&gateway_order_id, payment_id),
        "order_id": order_id,
        "cart_items": cart_items,
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}
