//! Persistence contracts for carts, orders, payments and the catalog.
//!
//! All reads and writes go through a [`Session`], a unit of work obtained
//! from a [`Database`]. Writes become visible only on [`Session::commit`];
//! dropping a session discards them. The `lock_*` operations take an
//! exclusive per-row lock that is held until the session ends, which is how
//! the services serialize concurrent mutation of one cart or one order.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Cart, CartItem, NewCartItem, NewOrder, NewOrderItem, NewPaymentTransaction, NewProduct, Order,
    OrderItem, OrderStatus, PaymentStatus, PaymentTransaction, Product,
};

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A concurrent writer won; the caller may retry.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StoreError::Conflict(db_err.message().to_string());
            }
            // serialization_failure, deadlock_detected
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Entry point to a store backend.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Session: Session;

    /// Open a unit of work.
    async fn begin(&self) -> StoreResult<Self::Session>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// A unit of work spanning every store contract.
#[async_trait]
pub trait Session: CartStore + OrderStore + PaymentStore + CatalogStore + Send {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

#[async_trait]
pub trait CartStore {
    /// Cart with its items, if the user has one.
    async fn find_by_user(&mut self, user_id: Uuid) -> StoreResult<Option<Cart>>;

    /// Like [`CartStore::find_by_user`] but holds the cart exclusively until
    /// the session ends. Items are read after the lock is granted.
    async fn lock_by_user(&mut self, user_id: Uuid) -> StoreResult<Option<Cart>>;

    /// Lock a cart by its own id. Item mutations take this lock before
    /// touching `cart_items` so every writer locks the cart row first.
    async fn lock_cart(&mut self, cart_id: Uuid) -> StoreResult<Option<Cart>>;

    /// Create the user's cart unless one exists; returns the cart id either way.
    async fn create_cart(&mut self, user_id: Uuid) -> StoreResult<Uuid>;

    async fn find_item(&mut self, item_id: Uuid) -> StoreResult<Option<CartItem>>;

    async fn find_item_by_cart_and_product(
        &mut self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> StoreResult<Option<CartItem>>;

    async fn create_item(&mut self, item: &NewCartItem) -> StoreResult<CartItem>;

    /// Persist a new quantity for an existing item.
    async fn update_item(&mut self, item: &CartItem) -> StoreResult<CartItem>;

    /// Returns whether a row was removed.
    async fn delete_item(&mut self, item_id: Uuid) -> StoreResult<bool>;

    /// Returns the number of rows removed.
    async fn delete_items_by_cart(&mut self, cart_id: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait OrderStore {
    /// Insert the order row; the returned order has no items yet.
    async fn create_order(&mut self, order: &NewOrder) -> StoreResult<Order>;

    async fn create_order_item(&mut self, item: &NewOrderItem) -> StoreResult<OrderItem>;

    /// Newest first, items attached.
    async fn find_orders_by_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Order>>;

    async fn find_order_by_id(&mut self, order_id: Uuid) -> StoreResult<Option<Order>>;

    /// Find and hold the order exclusively until the session ends.
    async fn lock_order(&mut self, order_id: Uuid) -> StoreResult<Option<Order>>;

    async fn update_order_status(&mut self, order_id: Uuid, status: OrderStatus)
        -> StoreResult<()>;
}

#[async_trait]
pub trait PaymentStore {
    async fn create(&mut self, tx: &NewPaymentTransaction) -> StoreResult<PaymentTransaction>;

    /// Move a `pending` record to a terminal status. Fails with
    /// [`StoreError::Conflict`] if the record is not pending.
    async fn update_status(
        &mut self,
        id: Uuid,
        status: PaymentStatus,
        provider_tx_id: Option<&str>,
        failure_message: Option<&str>,
    ) -> StoreResult<PaymentTransaction>;

    /// Most recent attempt for the order.
    async fn find_by_order(&mut self, order_id: Uuid) -> StoreResult<Option<PaymentTransaction>>;

    /// All attempts for the order, oldest first.
    async fn list_by_order(&mut self, order_id: Uuid) -> StoreResult<Vec<PaymentTransaction>>;

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> StoreResult<Option<PaymentTransaction>>;
}

#[async_trait]
pub trait CatalogStore {
    async fn list_products(&mut self) -> StoreResult<Vec<Product>>;

    async fn find_product(&mut self, product_id: Uuid) -> StoreResult<Option<Product>>;

    async fn create_product(&mut self, product: &NewProduct) -> StoreResult<Product>;

    async fn update_product(
        &mut self,
        product_id: Uuid,
        product: &NewProduct,
    ) -> StoreResult<Option<Product>>;

    async fn delete_product(&mut self, product_id: Uuid) -> StoreResult<bool>;
}
