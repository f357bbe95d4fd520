//! Catalog endpoints. Reads are public, writes need a token.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::ProductRequest;
use crate::middleware::AuthUser;
use crate::models::Product;
use crate::startup::AppState;
use crate::store::Database;

pub async fn list_products<D: Database>(
    State(state): State<AppState<D>>,
) -> Result<Json<Vec<Product>>, AppError> {
    Ok(Json(state.catalog.list_products().await?))
}

pub async fn get_product<D: Database>(
    State(state): State<AppState<D>>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<Product>, AppError> {
    Ok(Json(state.catalog.get_product(product_id).await?))
}

pub async fn create_product<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Json(payload): Json<ProductRequest>,
) -> Result<(StatusCode, Json<Product>), AppError> {
    payload.validate()?;

    tracing::info!(user_id = %auth.user_id, sku = %payload.sku, "Creating product");

    let product = state.catalog.create_product(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn update_product<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<ProductRequest>,
) -> Result<Json<Product>, AppError> {
    payload.validate()?;

    tracing::info!(user_id = %auth.user_id, product_id = %product_id, "Updating product");

    let product = state
        .catalog
        .update_product(product_id, payload.into())
        .await?;
    Ok(Json(product))
}

pub async fn delete_product<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(product_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    tracing::info!(user_id = %auth.user_id, product_id = %product_id, "Deleting product");

    state.catalog.delete_product(product_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
