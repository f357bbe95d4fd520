//! Decimal money helpers.
//!
//! Amounts are `Decimal` in the currency's major unit everywhere inside the
//! service. The only conversion to integers happens at the gateway boundary,
//! through [`to_minor_units`], which refuses to round.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("currency code '{0}' must be three ASCII letters")]
    InvalidCurrency(String),

    #[error("amount {amount} must be positive")]
    NonPositive { amount: Decimal },

    #[error("amount {amount} has more precision than {currency} allows")]
    SubMinorUnit { amount: Decimal, currency: String },

    #[error("amount {0} overflows the supported range")]
    Overflow(Decimal),
}

pub const DEFAULT_CURRENCY: &str = "usd";

/// Lower-cases and validates an ISO 4217 style code.
pub fn normalize_currency(code: &str) -> Result<String, MoneyError> {
    let code = code.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(MoneyError::InvalidCurrency(code.to_string()));
    }
    Ok(code.to_ascii_lowercase())
}

/// Number of decimal places in the currency's minor unit.
pub fn minor_unit_exponent(currency: &str) -> u32 {
    match currency {
        "bif" | "clp" | "djf" | "gnf" | "isk" | "jpy" | "kmf" | "krw" | "pyg" | "rwf" | "ugx"
        | "vnd" | "vuv" | "xaf" | "xof" | "xpf" => 0,
        "bhd" | "jod" | "kwd" | "omr" | "tnd" => 3,
        _ => 2,
    }
}

/// Converts a major-unit amount into the gateway's integer minor units.
///
/// `currency` must already be normalized.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NonPositive { amount });
    }

    let factor = Decimal::from(10_i64.pow(minor_unit_exponent(currency)));
    let scaled = amount
        .checked_mul(factor)
        .ok_or(MoneyError::Overflow(amount))?;

    if !scaled.fract().is_zero() {
        return Err(MoneyError::SubMinorUnit {
            amount,
            currency: currency.to_string(),
        });
    }

    scaled.trunc().to_i64().ok_or(MoneyError::Overflow(amount))
}

/// `quantity x unit_price` for one line.
pub fn line_total(quantity: i32, unit_price: Decimal) -> Option<Decimal> {
    unit_price.checked_mul(Decimal::from(quantity))
}

/// Sum of line totals; `None` on overflow.
pub fn order_total<I>(lines: I) -> Option<Decimal>
where
    I: IntoIterator<Item = (i32, Decimal)>,
{
    lines
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, (quantity, unit_price)| {
            acc.checked_add(line_total(quantity, unit_price)?)
        })
}
