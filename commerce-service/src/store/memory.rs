//! In-process store backend.
//!
//! A session holds the single state mutex for its whole lifetime, so sessions
//! are fully serialized and every `lock_*` call is trivially satisfied. Writes
//! go to a private copy of the tables that replaces the shared state on
//! commit, which gives the same all-or-nothing behavior as a database
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    CartStore, CatalogStore, Database, OrderStore, PaymentStore, Session, StoreError, StoreResult,
};
use crate::models::{
    Cart, CartItem, NewCartItem, NewOrder, NewOrderItem, NewPaymentTransaction, NewProduct, Order,
    OrderItem, OrderStatus, PaymentStatus, PaymentTransaction, Product,
};

#[derive(Debug, Clone)]
struct CartRow {
    id: Uuid,
    user_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    total: rust_decimal::Decimal,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    carts: Vec<CartRow>,
    cart_items: Vec<CartItem>,
    orders: Vec<OrderRow>,
    order_items: Vec<OrderItem>,
    payments: Vec<PaymentTransaction>,
    products: Vec<Product>,
}

impl Tables {
    fn assemble_cart(&self, row: &CartRow) -> Cart {
        Cart {
            id: row.id,
            user_id: row.user_id,
            items: self
                .cart_items
                .iter()
                .filter(|i| i.cart_id == row.id)
                .cloned()
                .collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }

    fn assemble_order(&self, row: &OrderRow) -> Order {
        Order {
            id: row.id,
            user_id: row.user_id,
            total: row.total,
            status: row.status,
            items: self
                .order_items
                .iter()
                .filter(|i| i.order_id == row.id)
                .cloned()
                .collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Shared in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<StdMutex<HashMap<&'static str, usize>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to the named store operation fail with
    /// [`StoreError::Integrity`]. Used to exercise rollback paths.
    pub fn fail_next(&self, operation: &'static str) {
        self.fail_times(operation, 1);
    }

    /// Like [`MemoryDatabase::fail_next`] for the next `times` calls.
    pub fn fail_times(&self, operation: &'static str, times: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults.entry(operation).or_default() += times;
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Session = MemorySession;

    async fn begin(&self) -> StoreResult<MemorySession> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemorySession {
            guard,
            working,
            faults: self.faults.clone(),
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub struct MemorySession {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    faults: Arc<StdMutex<HashMap<&'static str, usize>>>,
}

impl MemorySession {
    fn check_fault(&self, operation: &'static str) -> StoreResult<()> {
        let tripped = self
            .faults
            .lock()
            .map(|mut faults| match faults.get_mut(operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if tripped {
            return Err(StoreError::Integrity(format!(
                "injected fault in {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn commit(self) -> StoreResult<()> {
        let MemorySession {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl CartStore for MemorySession {
    async fn find_by_user(&mut self, user_id: Uuid) -> StoreResult<Option<Cart>> {
        self.check_fault("find_by_user")?;
        let tables = &self.working;
        Ok(tables
            .carts
            .iter()
            .find(|c| c.user_id == user_id)
            .map(|row| tables.assemble_cart(row)))
    }

    async fn lock_by_user(&mut self, user_id: Uuid) -> StoreResult<Option<Cart>> {
        self.check_fault("lock_by_user")?;
        self.find_by_user(user_id).await
    }

    async fn lock_cart(&mut self, cart_id: Uuid) -> StoreResult<Option<Cart>> {
        self.check_fault("lock_cart")?;
        let tables = &self.working;
        Ok(tables
            .carts
            .iter()
            .find(|c| c.id == cart_id)
            .map(|row| tables.assemble_cart(row)))
    }

    async fn create_cart(&mut self, user_id: Uuid) -> StoreResult<Uuid> {
        self.check_fault("create_cart")?;
        if let Some(existing) = self.working.carts.iter().find(|c| c.user_id == user_id) {
            return Ok(existing.id);
        }
        let now = Utc::now();
        let row = CartRow {
            id: Uuid::new_v4(),
            user_id,
            created_at: now,
            updated_at: now,
        };
        let id = row.id;
        self.working.carts.push(row);
        Ok(id)
    }

    async fn find_item(&mut self, item_id: Uuid) -> StoreResult<Option<CartItem>> {
        self.check_fault("find_item")?;
        Ok(self
            .working
            .cart_items
            .iter()
            .find(|i| i.id == item_id)
            .cloned())
    }

    async fn find_item_by_cart_and_product(
        &mut self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> StoreResult<Option<CartItem>> {
        self.check_fault("find_item_by_cart_and_product")?;
        Ok(self
            .working
            .cart_items
            .iter()
            .find(|i| i.cart_id == cart_id && i.product_id == product_id)
            .cloned())
    }

    async fn create_item(&mut self, item: &NewCartItem) -> StoreResult<CartItem> {
        self.check_fault("create_item")?;
        if !self.working.carts.iter().any(|c| c.id == item.cart_id) {
            return Err(StoreError::Integrity(format!(
                "cart {} does not exist",
                item.cart_id
            )));
        }
        if self
            .working
            .cart_items
            .iter()
            .any(|i| i.cart_id == item.cart_id && i.product_id == item.product_id)
        {
            return Err(StoreError::Conflict(format!(
                "cart {} already has a line for product {}",
                item.cart_id, item.product_id
            )));
        }
        let now = Utc::now();
        let created = CartItem {
            id: Uuid::new_v4(),
            cart_id: item.cart_id,
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            created_at: now,
            updated_at: now,
        };
        self.working.cart_items.push(created.clone());
        Ok(created)
    }

    async fn update_item(&mut self, item: &CartItem) -> StoreResult<CartItem> {
        self.check_fault("update_item")?;
        let stored = self
            .working
            .cart_items
            .iter_mut()
            .find(|i| i.id == item.id)
            .ok_or_else(|| StoreError::Integrity(format!("cart item {} vanished", item.id)))?;
        stored.quantity = item.quantity;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_item(&mut self, item_id: Uuid) -> StoreResult<bool> {
        self.check_fault("delete_item")?;
        let before = self.working.cart_items.len();
        self.working.cart_items.retain(|i| i.id != item_id);
        Ok(self.working.cart_items.len() != before)
    }

    async fn delete_items_by_cart(&mut self, cart_id: Uuid) -> StoreResult<u64> {
        self.check_fault("delete_items_by_cart")?;
        let before = self.working.cart_items.len();
        self.working.cart_items.retain(|i| i.cart_id != cart_id);
        Ok((before - self.working.cart_items.len()) as u64)
    }
}

#[async_trait]
impl OrderStore for MemorySession {
    async fn create_order(&mut self, order: &NewOrder) -> StoreResult<Order> {
        self.check_fault("create_order")?;
        let now = Utc::now();
        let row = OrderRow {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            total: order.total,
            status: order.status,
            created_at: now,
            updated_at: now,
        };
        let created = self.working.assemble_order(&row);
        self.working.orders.push(row);
        Ok(created)
    }

    async fn create_order_item(&mut self, item: &NewOrderItem) -> StoreResult<OrderItem> {
        self.check_fault("create_order_item")?;
        if !self.working.orders.iter().any(|o| o.id == item.order_id) {
            return Err(StoreError::Integrity(format!(
                "order {} does not exist",
                item.order_id
            )));
        }
        let now = Utc::now();
        let created = OrderItem {
            id: Uuid::new_v4(),
            order_id: item.order_id,
            product_id: item.product_id,
            quantity: item.quantity,
            unit_price: item.unit_price,
            created_at: now,
            updated_at: now,
        };
        self.working.order_items.push(created.clone());
        Ok(created)
    }

    async fn find_orders_by_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Order>> {
        self.check_fault("find_orders_by_user")?;
        let tables = &self.working;
        Ok(tables
            .orders
            .iter()
            .rev()
            .filter(|o| o.user_id == user_id)
            .map(|row| tables.assemble_order(row))
            .collect())
    }

    async fn find_order_by_id(&mut self, order_id: Uuid) -> StoreResult<Option<Order>> {
        self.check_fault("find_order_by_id")?;
        let tables = &self.working;
        Ok(tables
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .map(|row| tables.assemble_order(row)))
    }

    async fn lock_order(&mut self, order_id: Uuid) -> StoreResult<Option<Order>> {
        self.check_fault("lock_order")?;
        self.find_order_by_id(order_id).await
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> StoreResult<()> {
        self.check_fault("update_order_status")?;
        let row = self
            .working
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| StoreError::Integrity(format!("order {} does not exist", order_id)))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for MemorySession {
    async fn create(&mut self, tx: &NewPaymentTransaction) -> StoreResult<PaymentTransaction> {
        self.check_fault("create_payment")?;
        if self
            .working
            .payments
            .iter()
            .any(|p| p.idempotency_key == tx.idempotency_key)
        {
            return Err(StoreError::Conflict(format!(
                "idempotency key '{}' already used",
                tx.idempotency_key
            )));
        }
        let now = Utc::now();
        let created = PaymentTransaction {
            id: Uuid::new_v4(),
            order_id: tx.order_id,
            amount: tx.amount,
            currency: tx.currency.clone(),
            provider: tx.provider.clone(),
            token: tx.token.clone(),
            status: PaymentStatus::Pending,
            provider_tx_id: None,
            failure_message: None,
            idempotency_key: tx.idempotency_key.clone(),
            created_at: now,
            updated_at: now,
        };
        self.working.payments.push(created.clone());
        Ok(created)
    }

    async fn update_status(
        &mut self,
        id: Uuid,
        status: PaymentStatus,
        provider_tx_id: Option<&str>,
        failure_message: Option<&str>,
    ) -> StoreResult<PaymentTransaction> {
        self.check_fault("update_payment_status")?;
        let stored = self
            .working
            .payments
            .iter_mut()
            .find(|p| p.id == id && p.status == PaymentStatus::Pending)
            .ok_or_else(|| {
                StoreError::Conflict(format!("payment {} is not pending", id))
            })?;
        stored.status = status;
        stored.provider_tx_id = provider_tx_id.map(str::to_string);
        stored.failure_message = failure_message.map(str::to_string);
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn find_by_order(&mut self, order_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        self.check_fault("find_payment_by_order")?;
        Ok(self
            .working
            .payments
            .iter()
            .rev()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn list_by_order(&mut self, order_id: Uuid) -> StoreResult<Vec<PaymentTransaction>> {
        self.check_fault("list_payments_by_order")?;
        Ok(self
            .working
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> StoreResult<Option<PaymentTransaction>> {
        self.check_fault("find_payment_by_idempotency_key")?;
        Ok(self
            .working
            .payments
            .iter()
            .find(|p| p.idempotency_key == key)
            .cloned())
    }
}

#[async_trait]
impl CatalogStore for MemorySession {
    async fn list_products(&mut self) -> StoreResult<Vec<Product>> {
        self.check_fault("list_products")?;
        Ok(self.working.products.clone())
    }

    async fn find_product(&mut self, product_id: Uuid) -> StoreResult<Option<Product>> {
        self.check_fault("find_product")?;
        Ok(self
            .working
            .products
            .iter()
            .find(|p| p.id == product_id)
            .cloned())
    }

    async fn create_product(&mut self, product: &NewProduct) -> StoreResult<Product> {
        self.check_fault("create_product")?;
        if self.working.products.iter().any(|p| p.sku == product.sku) {
            return Err(StoreError::Conflict(format!(
                "sku '{}' already exists",
                product.sku
            )));
        }
        let now = Utc::now();
        let created = Product {
            id: Uuid::new_v4(),
            name: product.name.clone(),
            description: product.description.clone(),
            price: product.price,
            sku: product.sku.clone(),
            created_at: now,
            updated_at: now,
        };
        self.working.products.push(created.clone());
        Ok(created)
    }

    async fn update_product(
        &mut self,
        product_id: Uuid,
        product: &NewProduct,
    ) -> StoreResult<Option<Product>> {
        self.check_fault("update_product")?;
        if self
            .working
            .products
            .iter()
            .any(|p| p.sku == product.sku && p.id != product_id)
        {
            return Err(StoreError::Conflict(format!(
                "sku '{}' already exists",
                product.sku
            )));
        }
        Ok(self
            .working
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .map(|stored| {
                stored.name = product.name.clone();
                stored.description = product.description.clone();
                stored.price = product.price;
                stored.sku = product.sku.clone();
                stored.updated_at = Utc::now();
                stored.clone()
            }))
    }

    async fn delete_product(&mut self, product_id: Uuid) -> StoreResult<bool> {
        self.check_fault("delete_product")?;
        let before = self.working.products.len();
        self.working.products.retain(|p| p.id != product_id);
        let removed = self.working.products.len() != before;
        if removed {
            self.working.cart_items.retain(|i| i.product_id != product_id);
        }
        Ok(removed)
    }
}
