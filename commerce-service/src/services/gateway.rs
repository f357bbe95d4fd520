//! Settlement gateway contract and the in-process simulated gateway.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A charge in the gateway's own units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub amount_minor: i64,
    /// Lower-cased ISO code.
    pub currency: String,
    pub token: String,
    /// Forwarded so the provider de-duplicates retried calls.
    pub idempotency_key: String,
}

/// What the gateway reports for an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub provider_tx_id: String,
    /// Provider status string, e.g. `succeeded`.
    pub status: String,
}

impl ChargeReceipt {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The card or payment method was refused.
    #[error("declined ({code}): {message}")]
    Declined { code: String, message: String },

    /// The provider rejected the request itself.
    #[error("rejected by provider ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gateway '{0}' is not configured")]
    NotConfigured(String),

    #[error("gateway did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Provider name recorded on the payment row.
    fn name(&self) -> &str;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;
}

/// Gateways by provider name.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn SettlementGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn SettlementGateway>) {
        self.gateways.insert(gateway.name().to_string(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn SettlementGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn SettlementGateway>> {
        self.gateways.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.gateways.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Deterministic gateway for local runs and tests.
///
/// `tok_chargeDeclined` is declined, `tok_error` fails in transport and every
/// other token succeeds.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway;

pub const SIMULATED_PROVIDER: &str = "simulated";

#[async_trait]
impl SettlementGateway for SimulatedGateway {
    fn name(&self) -> &str {
        SIMULATED_PROVIDER
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        match request.token.as_str() {
            "tok_chargeDeclined" => Err(GatewayError::Declined {
                code: "card_declined".to_string(),
                message: "Your card was declined.".to_string(),
            }),
            "tok_error" => Err(GatewayError::Transport(
                "connection reset by simulated gateway".to_string(),
            )),
            _ => Ok(ChargeReceipt {
                provider_tx_id: format!("sim_{}", uuid::Uuid::new_v4().simple()),
                status: "succeeded".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(token: &str) -> ChargeRequest {
        ChargeRequest {
            amount_minor: 2500,
            currency: "usd".to_string(),
            token: token.to_string(),
            idempotency_key: "order:1:attempt:1".to_string(),
        }
    }

    #[tokio::test]
    async fn simulated_gateway_follows_test_tokens() {
        let gateway = SimulatedGateway;

        let receipt = gateway.charge(&request("tok_visa")).await.unwrap();
        assert!(receipt.is_succeeded());
        assert!(receipt.provider_tx_id.starts_with("sim_"));

        assert!(matches!(
            gateway.charge(&request("tok_chargeDeclined")).await,
            Err(GatewayError::Declined { .. })
        ));
        assert!(matches!(
            gateway.charge(&request("tok_error")).await,
            Err(GatewayError::Transport(_))
        ));
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = GatewayRegistry::new().with(Arc::new(SimulatedGateway));
        assert!(registry.get("simulated").is_some());
        assert!(registry.get("stripe").is_none());
        assert_eq!(registry.providers(), vec!["simulated"]);
    }
}
