//! Order payment endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::PayOrderRequest;
use crate::middleware::AuthUser;
use crate::models::{Order, PaymentTransaction};
use crate::services::stripe::STRIPE_PROVIDER;
use crate::services::PaymentInstruction;
use crate::startup::AppState;
use crate::store::Database;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

async fn owned_order<D: Database>(
    state: &AppState<D>,
    auth: &AuthUser,
    order_id: Uuid,
) -> Result<Order, AppError> {
    let order = state.checkout.get_order_by_id(order_id).await?;
    auth.ensure_owner(order.user_id)?;
    Ok(order)
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Idempotency-Key must be ASCII")))?
        .trim();
    if key.is_empty() || key.len() > 255 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Idempotency-Key must be 1 to 255 characters"
        )));
    }
    Ok(Some(key.to_string()))
}

/// Charges the order total.
pub async fn pay_order<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<PayOrderRequest>,
) -> Result<(StatusCode, Json<PaymentTransaction>), AppError> {
    payload.validate()?;
    let idempotency_key = idempotency_key(&headers)?;
    let order = owned_order(&state, &auth, order_id).await?;

    let instruction = PaymentInstruction {
        order_id: order.id,
        amount: order.total,
        currency: payload
            .currency
            .unwrap_or_else(|| state.config.payments.default_currency.clone()),
        provider: payload
            .provider
            .unwrap_or_else(|| STRIPE_PROVIDER.to_string()),
        token: payload.token,
        idempotency_key,
    };

    tracing::info!(
        order_id = %order.id,
        amount = %instruction.amount,
        provider = %instruction.provider,
        "Processing payment"
    );

    let tx = state.payments.process_payment(instruction).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

/// Latest attempt.
pub async fn get_payment<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<PaymentTransaction>, AppError> {
    owned_order(&state, &auth, order_id).await?;
    Ok(Json(state.payments.get_payment_by_order(order_id).await?))
}

pub async fn list_payments<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentTransaction>>, AppError> {
    owned_order(&state, &auth, order_id).await?;
    Ok(Json(state.payments.list_payments_for_order(order_id).await?))
}
