//! Product catalog reads and writes.

use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{CommerceError, CommerceResult};
use crate::models::money::{to_minor_units, DEFAULT_CURRENCY};
use crate::models::{NewProduct, Product};
use crate::store::{CatalogStore, Database, Session};

pub struct Catalog<D> {
    db: Arc<D>,
    /// Prices must be chargeable in this currency.
    currency: String,
}

impl<D> Clone for Catalog<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            currency: self.currency.clone(),
        }
    }
}

impl<D: Database> Catalog<D> {
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

    /// Positive and no finer than the currency's minor unit.
    fn check_price(&self, product: &NewProduct) -> CommerceResult<()> {
        to_minor_units(product.price, &self.currency)?;
        Ok(())
    }

    pub async fn list_products(&self) -> CommerceResult<Vec<Product>> {
        let mut session = self.db.begin().await?;
        Ok(session.list_products().await?)
    }

    pub async fn get_product(&self, product_id: Uuid) -> CommerceResult<Product> {
        let mut session = self.db.begin().await?;
        session
            .find_product(product_id)
            .await?
            .ok_or_else(|| CommerceError::not_found(format!("product {}", product_id)))
    }

    #[instrument(skip(self, product), fields(sku = %product.sku))]
    pub async fn create_product(&self, product: NewProduct) -> CommerceResult<Product> {
        self.check_price(&product)?;
        let mut session = self.db.begin().await?;
        let created = session.create_product(&product).await.map_err(|e| {
            if e.is_conflict() {
                CommerceError::Conflict(format!("sku '{}' already exists", product.sku))
            } else {
                e.into()
            }
        })?;
        session.commit().await?;

        info!(product_id = %created.id, "Product created");
        Ok(created)
    }

    #[instrument(skip(self, product))]
    pub async fn update_product(
        &self,
        product_id: Uuid,
        product: NewProduct,
    ) -> CommerceResult<Product> {
        self.check_price(&product)?;
        let mut session = self.db.begin().await?;
        let updated = session
            .update_product(product_id, &product)
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    CommerceError::Conflict(format!("sku '{}' already exists", product.sku))
                } else {
                    e.into()
                }
            })?
            .ok_or_else(|| CommerceError::not_found(format!("product {}", product_id)))?;
        session.commit().await?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete_product(&self, product_id: Uuid) -> CommerceResult<()> {
        let mut session = self.db.begin().await?;
        if !session.delete_product(product_id).await? {
            return Err(CommerceError::not_found(format!("product {}", product_id)));
        }
        session.commit().await?;
        info!(product_id = %product_id, "Product deleted");
        Ok(())
    }
}
