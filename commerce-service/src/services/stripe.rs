//! Stripe payment provider client.
//!
//! Creates charges through Stripe's Charges API. Amounts are sent in the
//! currency's minor unit and every call carries the payment attempt's
//! idempotency key.

use crate::config::StripeConfig;
use crate::services::gateway::{ChargeReceipt, ChargeRequest, GatewayError, SettlementGateway};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;

pub const STRIPE_PROVIDER: &str = "stripe";

/// Stripe client for interacting with the Stripe API.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

/// Response from Stripe charge creation.
#[derive(Debug, Deserialize)]
pub struct StripeCharge {
    /// Charge ID (`ch_...`).
    pub id: String,
    /// Amount in smallest currency unit.
    pub amount: i64,
    pub currency: String,
    /// `succeeded`, `pending` or `failed`.
    pub status: String,
    pub failure_message: Option<String>,
}

/// Stripe API error response.
#[derive(Debug, Deserialize)]
pub struct StripeError {
    pub error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct StripeErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: Option<String>,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }
}

#[async_trait]
impl SettlementGateway for StripeGateway {
    fn name(&self) -> &str {
        STRIPE_PROVIDER
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured(STRIPE_PROVIDER.to_string()));
        }

        let url = format!("{}/charges", self.config.api_base_url);
        let amount = request.amount_minor.to_string();
        let form = [
            ("amount", amount.as_str()),
            ("currency", request.currency.as_str()),
            ("source", request.token.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.secret_key.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, "Stripe create_charge response");

        if status.is_success() {
            let charge: StripeCharge = serde_json::from_str(&body).map_err(|e| {
                GatewayError::Transport(format!("unreadable Stripe response: {}", e))
            })?;
            tracing::info!(
                charge_id = %charge.id,
                amount = charge.amount,
                currency = %charge.currency,
                status = %charge.status,
                failure = ?charge.failure_message,
                "Stripe charge created"
            );
            return Ok(ChargeReceipt {
                provider_tx_id: charge.id,
                status: charge.status,
            });
        }

        let error: StripeError = serde_json::from_str(&body).unwrap_or_else(|_| StripeError {
            error: StripeErrorDetail {
                kind: "api_error".to_string(),
                code: None,
                decline_code: None,
                message: Some(body.clone()),
            },
        });
        let detail = error.error;
        let message = detail
            .message
            .unwrap_or_else(|| "no message from Stripe".to_string());

        tracing::warn!(
            http_status = status.as_u16(),
            error_type = %detail.kind,
            code = ?detail.code,
            "Stripe charge failed"
        );

        if detail.kind == "card_error" {
            let code = detail
                .decline_code
                .or(detail.code)
                .unwrap_or_else(|| "card_declined".to_string());
            Err(GatewayError::Declined { code, message })
        } else {
            Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base: &str, key: &str) -> StripeGateway {
        StripeGateway::new(StripeConfig {
            secret_key: Secret::new(key.to_string()),
            api_base_url: base.to_string(),
        })
    }

    fn request(token: &str) -> ChargeRequest {
        ChargeRequest {
            amount_minor: 2500,
            currency: "usd".to_string(),
            token: token.to_string(),
            idempotency_key: "order:abc:attempt:1".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_charge_returns_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(header("idempotency-key", "order:abc:attempt:1"))
            .and(body_string_contains("amount=2500"))
            .and(body_string_contains("source=tok_visa"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ch_1",
                "object": "charge",
                "amount": 2500,
                "currency": "usd",
                "status": "succeeded",
                "failure_message": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = gateway(&server.uri(), "sk_test_123")
            .charge(&request("tok_visa"))
            .await
            .unwrap();

        assert_eq!(receipt.provider_tx_id, "ch_1");
        assert!(receipt.is_succeeded());
    }

    #[tokio::test]
    async fn unsettled_charge_keeps_its_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ch_2",
                "amount": 2500,
                "currency": "usd",
                "status": "pending",
                "failure_message": "Awaiting bank confirmation"
            })))
            .mount(&server)
            .await;

        let receipt = gateway(&server.uri(), "sk_test_123")
            .charge(&request("tok_visa"))
            .await
            .unwrap();

        assert_eq!(receipt.provider_tx_id, "ch_2");
        assert_eq!(receipt.status, "pending");
        assert!(!receipt.is_succeeded());
    }

    #[tokio::test]
    async fn card_errors_become_declines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .respond_with(ResponseTemplate::new(402).set_body_json(serde_json::json!({
                "error": {
                    "type": "card_error",
                    "code": "card_declined",
                    "decline_code": "insufficient_funds",
                    "message": "Your card has insufficient funds."
                }
            })))
            .mount(&server)
            .await;

        let err = gateway(&server.uri(), "sk_test_123")
            .charge(&request("tok_chargeDeclined"))
            .await
            .unwrap_err();

        match err {
            GatewayError::Declined { code, message } => {
                assert_eq!(code, "insufficient_funds");
                assert!(message.contains("insufficient funds"));
            }
            other => panic!("expected decline, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn other_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .respond_with(ResponseTemplate::new(401).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = gateway(&server.uri(), "sk_test_bad")
            .charge(&request("tok_visa"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn refuses_to_call_without_credentials() {
        let err = gateway("http://127.0.0.1:9", "")
            .charge(&request("tok_visa"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured(_)));
    }
}
