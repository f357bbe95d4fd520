//! Cart endpoints, scoped to `/users/:user_id/cart`.
//!
//! The caller must be the user in the path. Item routes additionally check
//! that the item sits in that user's cart.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{AddCartItemRequest, CartItemResponse, CartResponse, UpdateCartItemRequest};
use crate::error::CommerceError;
use crate::middleware::AuthUser;
use crate::models::CartItem;
use crate::startup::AppState;
use crate::store::Database;

/// The item if it exists and belongs to the user's cart; `None` if it does
/// not exist at all. An item in someone else's cart is reported as missing.
async fn owned_item<D: Database>(
    state: &AppState<D>,
    user_id: Uuid,
    item_id: Uuid,
) -> Result<Option<CartItem>, AppError> {
    let Some(item) = state.carts.find_item(item_id).await? else {
        return Ok(None);
    };
    let cart = state.carts.find_cart(user_id).await?;
    if cart.map(|c| c.id) != Some(item.cart_id) {
        return Err(CommerceError::not_found(format!("cart item {}", item_id)).into());
    }
    Ok(Some(item))
}

pub async fn get_cart<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CartResponse>, AppError> {
    auth.ensure_owner(user_id)?;
    let cart = state.carts.get_or_create_cart(user_id).await?;
    Ok(Json(CartResponse::from(cart)))
}

pub async fn clear_cart<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CartResponse>, AppError> {
    auth.ensure_owner(user_id)?;
    let cart = state.carts.clear_cart(user_id).await?;
    Ok(Json(CartResponse::from(cart)))
}

/// Adds a product at its current catalog price.
pub async fn add_item<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<AddCartItemRequest>,
) -> Result<(StatusCode, Json<CartItemResponse>), AppError> {
    auth.ensure_owner(user_id)?;
    payload.validate()?;

    let product = state.catalog.get_product(payload.product_id).await?;

    tracing::info!(
        user_id = %user_id,
        product_id = %product.id,
        quantity = payload.quantity,
        "Adding item to cart"
    );

    let item = state
        .carts
        .add_item(user_id, product.id, payload.quantity, product.price)
        .await?;
    Ok((StatusCode::CREATED, Json(CartItemResponse::from(item))))
}

pub async fn update_item<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path((user_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateCartItemRequest>,
) -> Result<Json<CartItemResponse>, AppError> {
    auth.ensure_owner(user_id)?;
    payload.validate()?;

    if owned_item(&state, user_id, item_id).await?.is_none() {
        return Err(CommerceError::not_found(format!("cart item {}", item_id)).into());
    }

    let item = state.carts.update_item(item_id, payload.quantity).await?;
    Ok(Json(CartItemResponse::from(item)))
}

pub async fn remove_item<D: Database>(
    State(state): State<AppState<D>>,
    auth: AuthUser,
    Path((user_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    auth.ensure_owner(user_id)?;

    if owned_item(&state, user_id, item_id).await?.is_some() {
        state.carts.remove_item(item_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
