//! Domain errors for cart, checkout and payment operations.

use service_core::error::AppError;
use thiserror::Error;

use crate::models::money::MoneyError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CommerceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("cart is empty")]
    EmptyCart,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommerceError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        CommerceError::NotFound(what.to_string())
    }
}

impl From<MoneyError> for CommerceError {
    fn from(err: MoneyError) -> Self {
        CommerceError::InvalidInput(err.to_string())
    }
}

pub type CommerceResult<T> = Result<T, CommerceError>;

impl From<CommerceError> for AppError {
    fn from(err: CommerceError) -> Self {
        match err {
            CommerceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            CommerceError::EmptyCart => {
                AppError::UnprocessableEntity(anyhow::anyhow!("Cart is empty"))
            }
            CommerceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            CommerceError::PaymentFailed(msg) => {
                AppError::PaymentRequired(anyhow::anyhow!("Payment failed: {}", msg))
            }
            CommerceError::InvalidInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            CommerceError::Store(StoreError::Conflict(msg)) => {
                AppError::Conflict(anyhow::anyhow!("Concurrent update, retry: {}", msg))
            }
            CommerceError::Store(other) => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}
