//! Cart lifecycle: lazy creation, merge-on-add, quantity updates, removal.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{CommerceError, CommerceResult};
use crate::models::{Cart, CartItem, NewCartItem};
use crate::services::metrics::record_cart_operation;
use crate::store::{CartStore, Database, Session};

pub struct CartManager<D> {
    db: Arc<D>,
}

impl<D> Clone for CartManager<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

fn validate_quantity(quantity: i32) -> CommerceResult<()> {
    if quantity < 1 {
        return Err(CommerceError::InvalidInput(format!(
            "quantity must be at least 1, got {}",
            quantity
        )));
    }
    Ok(())
}

/// Ensures the user's cart exists and holds its lock for the rest of the session.
async fn lock_or_create<S: Session>(session: &mut S, user_id: Uuid) -> CommerceResult<Cart> {
    session.create_cart(user_id).await?;
    session.lock_by_user(user_id).await?.ok_or_else(|| {
        CommerceError::Conflict(format!("cart for user {} disappeared", user_id))
    })
}

impl<D: Database> CartManager<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    /// The user's cart with its items, created empty on first access.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_or_create_cart(&self, user_id: Uuid) -> CommerceResult<Cart> {
        let mut session = self.db.begin().await?;
        if let Some(cart) = session.find_by_user(user_id).await? {
            return Ok(cart);
        }

        session.create_cart(user_id).await?;
        let cart = session
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("cart for user {}", user_id)))?;
        session.commit().await?;

        info!(cart_id = %cart.id, "Cart created");
        Ok(cart)
    }

    /// Read-only lookup; never creates.
    pub async fn find_cart(&self, user_id: Uuid) -> CommerceResult<Option<Cart>> {
        let mut session = self.db.begin().await?;
        Ok(session.find_by_user(user_id).await?)
    }

    /// Adds `quantity` of a product. An existing line for the same product
    /// has its quantity incremented and keeps the price it was first added at.
    #[instrument(skip(self), fields(user_id = %user_id, product_id = %product_id))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
    ) -> CommerceResult<CartItem> {
        validate_quantity(quantity)?;
        if unit_price < Decimal::ZERO {
            return Err(CommerceError::InvalidInput(
                "unit price cannot be negative".to_string(),
            ));
        }

        let result = self
            .add_item_locked(user_id, product_id, quantity, unit_price)
            .await;
        record_cart_operation("add_item", result.is_ok());
        result
    }

    async fn add_item_locked(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
    ) -> CommerceResult<CartItem> {
        let mut session = self.db.begin().await?;
        let cart = lock_or_create(&mut session, user_id).await?;

        let item = match session
            .find_item_by_cart_and_product(cart.id, product_id)
            .await?
        {
            Some(mut existing) => {
                existing.quantity = existing.quantity.checked_add(quantity).ok_or_else(|| {
                    CommerceError::InvalidInput("quantity is too large".to_string())
                })?;
                session.update_item(&existing).await?
            }
            None => {
                session
                    .create_item(&NewCartItem {
                        cart_id: cart.id,
                        product_id,
                        quantity,
                        unit_price,
                    })
                    .await?
            }
        };

        session.commit().await?;
        info!(item_id = %item.id, quantity = item.quantity, "Cart item saved");
        Ok(item)
    }

    /// Sets an absolute quantity. Ownership is checked by the caller.
    #[instrument(skip(self))]
    pub async fn update_item(&self, item_id: Uuid, quantity: i32) -> CommerceResult<CartItem> {
        validate_quantity(quantity)?;

        let result = self.update_item_locked(item_id, quantity).await;
        record_cart_operation("update_item", result.is_ok());
        result
    }

    async fn update_item_locked(&self, item_id: Uuid, quantity: i32) -> CommerceResult<CartItem> {
        let mut session = self.db.begin().await?;
        let Some(mut item) = Self::locked_item(&mut session, item_id).await? else {
            return Err(CommerceError::not_found(format!("cart item {}", item_id)));
        };

        item.quantity = quantity;
        let item = session.update_item(&item).await?;
        session.commit().await?;
        Ok(item)
    }

    /// Removing an item that does not exist is not an error.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, item_id: Uuid) -> CommerceResult<()> {
        let result = self.remove_item_locked(item_id).await;
        record_cart_operation("remove_item", result.is_ok());
        result
    }

    async fn remove_item_locked(&self, item_id: Uuid) -> CommerceResult<()> {
        let mut session = self.db.begin().await?;
        let removed = match Self::locked_item(&mut session, item_id).await? {
            Some(_) => {
                let removed = session.delete_item(item_id).await?;
                session.commit().await?;
                removed
            }
            None => false,
        };

        tracing::debug!(removed = removed, "Cart item removal");
        Ok(())
    }

    /// Resolves the item's cart, locks it, then re-reads the item under the
    /// lock. `None` if the item is gone by then.
    async fn locked_item(
        session: &mut D::Session,
        item_id: Uuid,
    ) -> CommerceResult<Option<CartItem>> {
        let Some(item) = session.find_item(item_id).await? else {
            return Ok(None);
        };
        let Some(cart) = session.lock_cart(item.cart_id).await? else {
            return Ok(None);
        };
        if !cart.contains_item(item_id) {
            return Ok(None);
        }
        Ok(session.find_item(item_id).await?)
    }

    /// Empties the cart but keeps it for reuse.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn clear_cart(&self, user_id: Uuid) -> CommerceResult<Cart> {
        let mut session = self.db.begin().await?;
        let mut cart = lock_or_create(&mut session, user_id).await?;
        let removed = session.delete_items_by_cart(cart.id).await?;
        session.commit().await?;

        record_cart_operation("clear_cart", true);
        info!(cart_id = %cart.id, removed = removed, "Cart cleared");
        cart.items.clear();
        Ok(cart)
    }

    pub async fn find_item(&self, item_id: Uuid) -> CommerceResult<Option<CartItem>> {
        let mut session = self.db.begin().await?;
        Ok(session.find_item(item_id).await?)
    }
}
