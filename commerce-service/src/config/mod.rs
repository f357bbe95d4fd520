//! Configuration module for commerce-service.

use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CommerceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs against the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub auth: AuthConfig,
    pub payments: PaymentsConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 key used to verify bearer tokens.
    pub jwt_secret: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub stripe: StripeConfig,
    pub gateway_timeout_secs: u64,
    pub default_currency: String,
    pub simulated_gateway_enabled: bool,
}

impl PaymentsConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    pub api_base_url: String,
}

impl StripeConfig {
    pub fn is_configured(&self) -> bool {
        !self.secret_key.expose_secret().is_empty()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl CommerceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| DatabaseConfig {
                url: Secret::new(url),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
            });

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::ConfigError(anyhow::anyhow!("JWT_SECRET is required")))?;

        let default_currency = env::var("DEFAULT_CURRENCY")
            .unwrap_or_else(|_| crate::models::money::DEFAULT_CURRENCY.to_string());
        let default_currency = crate::models::money::normalize_currency(&default_currency)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("DEFAULT_CURRENCY: {}", e)))?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "commerce-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database,
            auth: AuthConfig {
                jwt_secret: Secret::new(jwt_secret),
            },
            payments: PaymentsConfig {
                stripe: StripeConfig {
                    secret_key: Secret::new(env::var("STRIPE_SECRET_KEY").unwrap_or_default()),
                    api_base_url: env::var("STRIPE_API_BASE_URL")
                        .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
                },
                gateway_timeout_secs: parse_env("GATEWAY_TIMEOUT_SECS", 15),
                default_currency,
                simulated_gateway_enabled: parse_env("SIMULATED_GATEWAY_ENABLED", false),
            },
        })
    }
}
