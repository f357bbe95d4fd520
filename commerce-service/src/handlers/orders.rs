//! Checkout and order history.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::AuthUser;
use crate::models::Order;
use crate::startup::AppState;
use crate::store::Database;

pub async fn create_order<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    auth.ensure_owner(user_id)?;

    let order = state.checkout.create_order(user_id).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn list_orders<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<Order>>, AppError> {
    auth.ensure_owner(user_id)?;
    Ok(Json(state.checkout.get_orders_for_user(user_id).await?))
}

pub async fn get_order<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state.checkout.get_order_by_id(order_id).await?;
    auth.ensure_owner(order.user_id)?;
    Ok(Json(order))
}
