//! Test helper module for commerce-service integration tests.
//!
//! Spawns the application on a random port against the in-memory store and
//! the simulated gateway, or against any other store via `spawn_with`.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use commerce_service::config::{
    AuthConfig, CommerceConfig, PaymentsConfig, StripeConfig,
};
use commerce_service::middleware::auth::Claims;
use commerce_service::services::{init_metrics, GatewayRegistry, SimulatedGateway};
use commerce_service::startup::Application;
use commerce_service::store::{Database, MemoryDatabase};
use jsonwebtoken::{encode, EncodingKey, Header};
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "integration-test-secret";

pub fn test_config() -> CommerceConfig {
    CommerceConfig {
        common: CoreConfig {
            port: 0, // Random port
            request_timeout_secs: 10,
        },
        service_name: "commerce-service-test".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        database: None,
        auth: AuthConfig {
            jwt_secret: Secret::new(TEST_JWT_SECRET.to_string()),
        },
        payments: PaymentsConfig {
            stripe: StripeConfig {
                secret_key: Secret::new(String::new()),
                api_base_url: "http://127.0.0.1:9/v1".to_string(),
            },
            gateway_timeout_secs: 5,
            default_currency: "usd".to_string(),
            simulated_gateway_enabled: true,
        },
    }
}

/// Signs a token for `user_id` with the test secret.
pub fn token_for(user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id,
        exp: (Utc::now() + Duration::hours(1)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .expect("Failed to sign test token")
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub client: reqwest::Client,
}

impl TestApp {
    /// Spawn against a fresh in-memory store with the simulated gateway.
    pub async fn spawn() -> Self {
        Self::spawn_with(Arc::new(MemoryDatabase::new())).await
    }

    pub async fn spawn_with<D: Database>(db: Arc<D>) -> Self {
        init_metrics();

        let gateways = GatewayRegistry::new().with(Arc::new(SimulatedGateway));
        let app = Application::build_with(test_config(), db, gateways)
            .await
            .expect("Failed to build test application");

        let http_port = app.http_port();
        let http_address = format!("http://127.0.0.1:{}", http_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            http_address,
            http_port,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.http_address, path)
    }

    /// Creates a product as an arbitrary authenticated user.
    pub async fn create_product(&self, sku: &str, price: &str) -> Value {
        let response = self
            .client
            .post(self.url("/products"))
            .bearer_auth(token_for(Uuid::new_v4()))
            .json(&json!({
                "name": format!("Product {}", sku),
                "description": "test product",
                "price": price,
                "sku": sku,
            }))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("Failed to parse JSON")
    }

    pub async fn add_to_cart(
        &self,
        user_id: Uuid,
        product_id: &Value,
        quantity: i32,
    ) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/users/{}/cart/items", user_id)))
            .bearer_auth(token_for(user_id))
            .json(&json!({ "product_id": product_id, "quantity": quantity }))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn checkout(&self, user_id: Uuid) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/users/{}/orders", user_id)))
            .bearer_auth(token_for(user_id))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn pay(
        &self,
        user_id: Uuid,
        order_id: &Value,
        token: &str,
        idempotency_key: Option<&str>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url(&format!("/orders/{}/pay", order_id.as_str().unwrap_or_default())))
            .bearer_auth(token_for(user_id))
            .json(&json!({ "token": token, "provider": "simulated" }));
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        request.send().await.expect("Failed to execute request")
    }

    /// A user with a pending order worth 25.00 (2 x 10.00 + 1 x 5.00).
    pub async fn pending_order(&self, user_id: Uuid) -> Value {
        let tag = Uuid::new_v4().simple().to_string();
        let a = self.create_product(&format!("A-{}", tag), "10.00").await;
        let b = self.create_product(&format!("B-{}", tag), "5.00").await;
        assert_eq!(self.add_to_cart(user_id, &a["id"], 2).await.status().as_u16(), 201);
        assert_eq!(self.add_to_cart(user_id, &b["id"], 1).await.status().as_u16(), 201);

        let response = self.checkout(user_id).await;
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("Failed to parse JSON")
    }
}
