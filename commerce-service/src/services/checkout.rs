//! Turns a cart into an immutable order snapshot.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{CommerceError, CommerceResult};
use crate::models::money::{to_minor_units, DEFAULT_CURRENCY};
use crate::models::{NewOrder, NewOrderItem, Order, OrderStatus};
use crate::services::metrics::ORDERS_TOTAL;
use crate::store::{CartStore, Database, OrderStore, Session};

pub struct CheckoutOrchestrator<D> {
    db: Arc<D>,
    /// Orders must be payable in this currency.
    currency: String,
}

impl<D> Clone for CheckoutOrchestrator<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            currency: self.currency.clone(),
        }
    }
}

impl<D: Database> CheckoutOrchestrator<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self {
            db,
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Freezes the user's cart into a `pending` order and empties the cart.
    ///
    /// Runs in one session holding the cart lock: either the order, its items
    /// and the emptied cart are all committed, or nothing is. A concurrent
    /// checkout of the same cart waits for the lock and then sees it empty.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create_order(&self, user_id: Uuid) -> CommerceResult<Order> {
        let result = self.create_order_locked(user_id).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(CommerceError::EmptyCart) => "empty_cart",
            Err(CommerceError::InvalidInput(_)) => "unpayable",
            Err(_) => "error",
        };
        ORDERS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn create_order_locked(&self, user_id: Uuid) -> CommerceResult<Order> {
        let mut session = self.db.begin().await?;

        let cart = match session.lock_by_user(user_id).await? {
            Some(cart) if !cart.is_empty() => cart,
            _ => return Err(CommerceError::EmptyCart),
        };

        let total = cart
            .subtotal()
            .ok_or_else(|| CommerceError::InvalidInput("cart total overflows".to_string()))?;
        // A total the gateway cannot charge would strand the order.
        to_minor_units(total, &self.currency)?;

        let mut order = session
            .create_order(&NewOrder {
                user_id,
                total,
                status: OrderStatus::Pending,
            })
            .await?;

        for item in &cart.items {
            let order_item = session
                .create_order_item(&NewOrderItem {
                    order_id: order.id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .await?;
            order.items.push(order_item);
        }

        let cleared = session.delete_items_by_cart(cart.id).await?;
        if cleared != cart.items.len() as u64 {
            warn!(
                cart_id = %cart.id,
                expected = cart.items.len(),
                cleared = cleared,
                "Cart changed under lock"
            );
            session.rollback().await?;
            return Err(CommerceError::Conflict(format!(
                "cart {} changed during checkout",
                cart.id
            )));
        }

        session.commit().await?;

        info!(
            order_id = %order.id,
            total = %order.total,
            item_count = order.items.len(),
            "Order created"
        );
        Ok(order)
    }

    pub async fn get_order_by_id(&self, order_id: Uuid) -> CommerceResult<Order> {
        let mut session = self.db.begin().await?;
        session
            .find_order_by_id(order_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("order {}", order_id)))
    }

    /// Newest first.
    pub async fn get_orders_for_user(&self, user_id: Uuid) -> CommerceResult<Vec<Order>> {
        let mut session = self.db.begin().await?;
        Ok(session.find_orders_by_user(user_id).await?)
    }
}
