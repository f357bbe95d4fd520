//! PostgreSQL store backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    CartStore, CatalogStore, Database, OrderStore, PaymentStore, Session, StoreError, StoreResult,
};
use crate::models::{
    Cart, CartItem, NewCartItem, NewOrder, NewOrderItem, NewPaymentTransaction, NewProduct, Order,
    OrderItem, OrderStatus, PaymentStatus, PaymentTransaction, Product,
};
use crate::services::metrics::DB_QUERY_DURATION;

const CART_ITEM_COLUMNS: &str =
    "id, cart_id, product_id, quantity, unit_price, created_at, updated_at";
const ORDER_ITEM_COLUMNS: &str =
    "id, order_id, product_id, quantity, unit_price, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, order_id, amount, currency, provider, token, status, \
     provider_tx_id, failure_message, idempotency_key, created_at, updated_at";
const PRODUCT_COLUMNS: &str = "id, name, description, price, sku, created_at, updated_at";

#[derive(FromRow)]
struct CartRow {
    id: Uuid,
    user_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CartRow {
    fn into_cart(self, items: Vec<CartItem>) -> Cart {
        Cart {
            id: self.id,
            user_id: self.user_id,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    total: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> StoreResult<Order> {
        let status = OrderStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Integrity(format!("order {} has unknown status '{}'", self.id, self.status))
        })?;
        Ok(Order {
            id: self.id,
            user_id: self.user_id,
            total: self.total,
            status,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    amount: Decimal,
    currency: String,
    provider: String,
    token: String,
    status: String,
    provider_tx_id: Option<String>,
    failure_message: Option<String>,
    idempotency_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentTransaction {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> StoreResult<Self> {
        let status = PaymentStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Integrity(format!("payment {} has unknown status '{}'", row.id, row.status))
        })?;
        Ok(PaymentTransaction {
            id: row.id,
            order_id: row.order_id,
            amount: row.amount,
            currency: row.currency,
            provider: row.provider,
            token: row.token,
            status,
            provider_tx_id: row.provider_tx_id,
            failure_message: row.failure_message,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Connection pool wrapper.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    #[instrument(skip(database_url), fields(service = "commerce-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Session = PgSession;

    async fn begin(&self) -> StoreResult<PgSession> {
        let tx = self.pool.begin().await?;
        Ok(PgSession { tx })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// One database transaction. Dropping it without commit rolls back.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

impl PgSession {
    async fn cart_items(&mut self, cart_id: Uuid) -> StoreResult<Vec<CartItem>> {
        let items = sqlx::query_as::<_, CartItem>(&format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items WHERE cart_id = $1 ORDER BY seq"
        ))
        .bind(cart_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(items)
    }

    async fn order_items(&mut self, order_ids: &[Uuid]) -> StoreResult<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {ORDER_ITEM_COLUMNS} FROM order_items WHERE order_id = ANY($1) \
             ORDER BY seq"
        ))
        .bind(order_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(items)
    }

    async fn attach_items(&mut self, rows: Vec<OrderRow>) -> StoreResult<Vec<Order>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for item in self.order_items(&ids).await? {
            by_order.entry(item.order_id).or_default().push(item);
        }
        rows.into_iter()
            .map(|row| {
                let items = by_order.remove(&row.id).unwrap_or_default();
                row.into_order(items)
            })
            .collect()
    }

    /// `key` is `"user_id"` or `"id"`.
    async fn select_cart(
        &mut self,
        key: &'static str,
        value: Uuid,
        for_update: bool,
    ) -> StoreResult<Option<Cart>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let row = sqlx::query_as::<_, CartRow>(&format!(
            "SELECT id, user_id, created_at, updated_at FROM carts WHERE {key} = $1{lock}"
        ))
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => {
                let items = self.cart_items(row.id).await?;
                Ok(Some(row.into_cart(items)))
            }
            None => Ok(None),
        }
    }

    async fn select_order(&mut self, order_id: Uuid, for_update: bool) -> StoreResult<Option<Order>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT id, user_id, total, status, created_at, updated_at FROM orders \
             WHERE id = $1{lock}"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => {
                let items = self.order_items(&[row.id]).await?;
                Ok(Some(row.into_order(items)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl CartStore for PgSession {
    #[instrument(skip(self))]
    async fn find_by_user(&mut self, user_id: Uuid) -> StoreResult<Option<Cart>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_cart_by_user"])
            .start_timer();
        let cart = self.select_cart("user_id", user_id, false).await?;
        timer.observe_duration();
        Ok(cart)
    }

    #[instrument(skip(self))]
    async fn lock_by_user(&mut self, user_id: Uuid) -> StoreResult<Option<Cart>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_cart_by_user"])
            .start_timer();
        let cart = self.select_cart("user_id", user_id, true).await?;
        timer.observe_duration();
        Ok(cart)
    }

    #[instrument(skip(self))]
    async fn lock_cart(&mut self, cart_id: Uuid) -> StoreResult<Option<Cart>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_cart"])
            .start_timer();
        let cart = self.select_cart("id", cart_id, true).await?;
        timer.observe_duration();
        Ok(cart)
    }

    #[instrument(skip(self))]
    async fn create_cart(&mut self, user_id: Uuid) -> StoreResult<Uuid> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_cart"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO carts (id, user_id, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?;

        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM carts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await?;

        timer.observe_duration();
        Ok(id)
    }

    async fn find_item(&mut self, item_id: Uuid) -> StoreResult<Option<CartItem>> {
        let item = sqlx::query_as::<_, CartItem>(&format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items WHERE id = $1"
        ))
        .bind(item_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(item)
    }

    async fn find_item_by_cart_and_product(
        &mut self,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> StoreResult<Option<CartItem>> {
        let item = sqlx::query_as::<_, CartItem>(&format!(
            "SELECT {CART_ITEM_COLUMNS} FROM cart_items WHERE cart_id = $1 AND product_id = $2"
        ))
        .bind(cart_id)
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(item)
    }

    #[instrument(skip(self, item), fields(cart_id = %item.cart_id, product_id = %item.product_id))]
    async fn create_item(&mut self, item: &NewCartItem) -> StoreResult<CartItem> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_cart_item"])
            .start_timer();

        let created = sqlx::query_as::<_, CartItem>(&format!(
            r#"
            INSERT INTO cart_items (id, cart_id, product_id, quantity, unit_price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            RETURNING {CART_ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(item.cart_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(item.unit_price)
        .fetch_one(&mut *self.tx)
        .await?;

        sqlx::query("UPDATE carts SET updated_at = NOW() WHERE id = $1")
            .bind(item.cart_id)
            .execute(&mut *self.tx)
            .await?;

        timer.observe_duration();
        Ok(created)
    }

    #[instrument(skip(self, item), fields(item_id = %item.id))]
    async fn update_item(&mut self, item: &CartItem) -> StoreResult<CartItem> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_cart_item"])
            .start_timer();

        let updated = sqlx::query_as::<_, CartItem>(&format!(
            r#"
            UPDATE cart_items SET quantity = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {CART_ITEM_COLUMNS}
            "#
        ))
        .bind(item.id)
        .bind(item.quantity)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::Integrity(format!("cart item {} vanished", item.id)))?;

        sqlx::query("UPDATE carts SET updated_at = NOW() WHERE id = $1")
            .bind(item.cart_id)
            .execute(&mut *self.tx)
            .await?;

        timer.observe_duration();
        Ok(updated)
    }

    async fn delete_item(&mut self, item_id: Uuid) -> StoreResult<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_cart_item"])
            .start_timer();
        let result = sqlx::query("DELETE FROM cart_items WHERE id = $1")
            .bind(item_id)
            .execute(&mut *self.tx)
            .await?;
        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    async fn delete_items_by_cart(&mut self, cart_id: Uuid) -> StoreResult<u64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["clear_cart"])
            .start_timer();
        let result = sqlx::query("DELETE FROM cart_items WHERE cart_id = $1")
            .bind(cart_id)
            .execute(&mut *self.tx)
            .await?;
        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OrderStore for PgSession {
    #[instrument(skip(self, order), fields(user_id = %order.user_id, total = %order.total))]
    async fn create_order(&mut self, order: &NewOrder) -> StoreResult<Order> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order"])
            .start_timer();

        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            INSERT INTO orders (id, user_id, total, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING id, user_id, total, status, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order.user_id)
        .bind(order.total)
        .bind(order.status.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        timer.observe_duration();
        row.into_order(Vec::new())
    }

    async fn create_order_item(&mut self, item: &NewOrderItem) -> StoreResult<OrderItem> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order_item"])
            .start_timer();

        let created = sqlx::query_as::<_, OrderItem>(&format!(
            r#"
            INSERT INTO order_items (id, order_id, product_id, quantity, unit_price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            RETURNING {ORDER_ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(item.order_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(item.unit_price)
        .fetch_one(&mut *self.tx)
        .await?;

        timer.observe_duration();
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn find_orders_by_user(&mut self, user_id: Uuid) -> StoreResult<Vec<Order>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_orders_by_user"])
            .start_timer();

        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT id, user_id, total, status, created_at, updated_at
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let orders = self.attach_items(rows).await?;
        timer.observe_duration();
        Ok(orders)
    }

    async fn find_order_by_id(&mut self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_order_by_id"])
            .start_timer();
        let order = self.select_order(order_id, false).await?;
        timer.observe_duration();
        Ok(order)
    }

    async fn lock_order(&mut self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_order"])
            .start_timer();
        let order = self.select_order(order_id, true).await?;
        timer.observe_duration();
        Ok(order)
    }

    async fn update_order_status(
        &mut self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(order_id)
                .bind(status.as_str())
                .execute(&mut *self.tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Integrity(format!(
                "order {} does not exist",
                order_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for PgSession {
    #[instrument(skip(self, tx), fields(order_id = %tx.order_id, idempotency_key = %tx.idempotency_key))]
    async fn create(&mut self, tx: &NewPaymentTransaction) -> StoreResult<PaymentTransaction> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment"])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payment_transactions
                (id, order_id, amount, currency, provider, token, status, idempotency_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, NOW(), NOW())
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(tx.order_id)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(&tx.provider)
        .bind(&tx.token)
        .bind(&tx.idempotency_key)
        .fetch_one(&mut *self.tx)
        .await?;

        timer.observe_duration();
        row.try_into()
    }

    #[instrument(skip(self, provider_tx_id, failure_message))]
    async fn update_status(
        &mut self,
        id: Uuid,
        status: PaymentStatus,
        provider_tx_id: Option<&str>,
        failure_message: Option<&str>,
    ) -> StoreResult<PaymentTransaction> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payment_status"])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payment_transactions
            SET status = $2, provider_tx_id = $3, failure_message = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(provider_tx_id)
        .bind(failure_message)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::Conflict(format!("payment {} is not pending", id)))?;

        timer.observe_duration();
        row.try_into()
    }

    async fn find_by_order(&mut self, order_id: Uuid) -> StoreResult<Option<PaymentTransaction>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn list_by_order(&mut self, order_id: Uuid) -> StoreResult<Vec<PaymentTransaction>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1 \
             ORDER BY created_at, id"
        ))
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }

    async fn find_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> StoreResult<Option<PaymentTransaction>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(PaymentTransaction::try_from).transpose()
    }
}

#[async_trait]
impl CatalogStore for PgSession {
    async fn list_products(&mut self) -> StoreResult<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY created_at, id"
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(products)
    }

    async fn find_product(&mut self, product_id: Uuid) -> StoreResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(product)
    }

    #[instrument(skip(self, product), fields(sku = %product.sku))]
    async fn create_product(&mut self, product: &NewProduct) -> StoreResult<Product> {
        let created = sqlx::query_as::<_, Product>(&format!(
            r#"
            INSERT INTO products (id, name, description, price, sku, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price)
        .bind(&product.sku)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(created)
    }

    async fn update_product(
        &mut self,
        product_id: Uuid,
        product: &NewProduct,
    ) -> StoreResult<Option<Product>> {
        let updated = sqlx::query_as::<_, Product>(&format!(
            r#"
            UPDATE products
            SET name = $2, description = $3, price = $4, sku = $5, updated_at = NOW()
            WHERE id = $1
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(product_id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price)
        .bind(&product.sku)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(updated)
    }

    async fn delete_product(&mut self, product_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(product_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
