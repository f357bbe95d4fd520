//! Application startup and lifecycle management.

use axum::extract::FromRef;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{CommerceConfig, PaymentsConfig};
use crate::handlers;
use crate::middleware::JwtVerifier;
use crate::services::{
    init_metrics, CartManager, Catalog, CheckoutOrchestrator, GatewayRegistry,
    PaymentOrchestrator, SimulatedGateway, StripeGateway,
};
use crate::store::{Database, MemoryDatabase, PgDatabase};

/// Shared application state.
pub struct AppState<D> {
    pub config: Arc<CommerceConfig>,
    pub db: Arc<D>,
    pub carts: CartManager<D>,
    pub checkout: CheckoutOrchestrator<D>,
    pub payments: PaymentOrchestrator<D>,
    pub catalog: Catalog<D>,
    pub jwt: JwtVerifier,
}

impl<D> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            db: self.db.clone(),
            carts: self.carts.clone(),
            checkout: self.checkout.clone(),
            payments: self.payments.clone(),
            catalog: self.catalog.clone(),
            jwt: self.jwt.clone(),
        }
    }
}

impl<D> FromRef<AppState<D>> for JwtVerifier {
    fn from_ref(state: &AppState<D>) -> Self {
        state.jwt.clone()
    }
}

impl<D: Database> AppState<D> {
    pub fn new(config: CommerceConfig, db: Arc<D>, gateways: GatewayRegistry) -> Self {
        let jwt = JwtVerifier::new(&config.auth.jwt_secret);
        let payments = PaymentOrchestrator::new(
            db.clone(),
            gateways,
            config.payments.gateway_timeout(),
        );
        Self {
            carts: CartManager::new(db.clone()),
            checkout: CheckoutOrchestrator::new(db.clone())
                .with_currency(config.payments.default_currency.clone()),
            catalog: Catalog::new(db.clone())
                .with_currency(config.payments.default_currency.clone()),
            payments,
            jwt,
            db,
            config: Arc::new(config),
        }
    }
}

/// Gateways enabled by configuration.
pub fn build_gateways(config: &PaymentsConfig) -> GatewayRegistry {
    let mut registry = GatewayRegistry::new();

    let stripe = StripeGateway::new(config.stripe.clone());
    if stripe.is_configured() {
        tracing::info!("Stripe gateway initialized");
        registry.register(Arc::new(stripe));
    } else {
        tracing::warn!("Stripe credentials not configured - stripe payments are disabled");
    }

    if config.simulated_gateway_enabled {
        tracing::warn!("Simulated payment gateway enabled - do not use in production");
        registry.register(Arc::new(SimulatedGateway));
    }

    if registry.providers().is_empty() {
        tracing::warn!("No payment gateways registered - payments will be rejected");
    } else {
        tracing::info!(providers = ?registry.providers(), "Payment gateways registered");
    }

    registry
}

pub fn router<D: Database>(state: AppState<D>) -> Router {
    let request_timeout = state.config.common.request_timeout();

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check::<D>))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/products",
            get(handlers::products::list_products::<D>)
                .post(handlers::products::create_product::<D>),
        )
        .route(
            "/products/:product_id",
            get(handlers::products::get_product::<D>)
                .put(handlers::products::update_product::<D>)
                .delete(handlers::products::delete_product::<D>),
        )
        .route(
            "/users/:user_id/cart",
            get(handlers::cart::get_cart::<D>).delete(handlers::cart::clear_cart::<D>),
        )
        .route(
            "/users/:user_id/cart/items",
            post(handlers::cart::add_item::<D>),
        )
        .route(
            "/users/:user_id/cart/items/:item_id",
            axum::routing::put(handlers::cart::update_item::<D>)
                .delete(handlers::cart::remove_item::<D>),
        )
        .route(
            "/users/:user_id/orders",
            post(handlers::orders::create_order::<D>).get(handlers::orders::list_orders::<D>),
        )
        .route("/orders/:order_id", get(handlers::orders::get_order::<D>))
        .route(
            "/orders/:order_id/pay",
            post(handlers::payments::pay_order::<D>),
        )
        .route(
            "/orders/:order_id/payment",
            get(handlers::payments::get_payment::<D>),
        )
        .route(
            "/orders/:order_id/payments",
            get(handlers::payments::list_payments::<D>),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build against PostgreSQL when a database is configured, otherwise
    /// against the in-memory store.
    pub async fn build(config: CommerceConfig) -> Result<Self, AppError> {
        init_metrics();
        let gateways = build_gateways(&config.payments);

        match config.database.clone() {
            Some(database) => {
                let db = PgDatabase::new(
                    database.url.expose_secret(),
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Self::build_with(config, Arc::new(db), gateways).await
            }
            None => {
                tracing::warn!("DATABASE_URL not set - using the in-memory store; data is not persisted");
                Self::build_with(config, Arc::new(MemoryDatabase::new()), gateways).await
            }
        }
    }

    /// Build with an explicit store and gateways. Binds `config.common.port`
    /// (use 0 for a random port).
    pub async fn build_with<D: Database>(
        config: CommerceConfig,
        db: Arc<D>,
        gateways: GatewayRegistry,
    ) -> Result<Self, AppError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = listener.local_addr()?.port();

        let router = router(AppState::new(config, db, gateways));

        tracing::info!(http_port = http_port, "Commerce service listener bound");

        Ok(Self {
            http_port,
            listener,
            router,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = "commerce-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );
        axum::serve(self.listener, self.router).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StripeConfig;
    use secrecy::Secret;

    fn payments(stripe_key: &str, simulated: bool) -> PaymentsConfig {
        PaymentsConfig {
            stripe: StripeConfig {
                secret_key: Secret::new(stripe_key.to_string()),
                api_base_url: "http://127.0.0.1:9/v1".to_string(),
            },
            gateway_timeout_secs: 5,
            default_currency: "usd".to_string(),
            simulated_gateway_enabled: simulated,
        }
    }

    #[test]
    fn only_usable_gateways_are_registered() {
        assert!(build_gateways(&payments("", false)).providers().is_empty());
        assert_eq!(
            build_gateways(&payments("", true)).providers(),
            vec!["simulated"]
        );
        assert_eq!(
            build_gateways(&payments("sk_test_123", true)).providers(),
            vec!["simulated", "stripe"]
        );
    }
}
