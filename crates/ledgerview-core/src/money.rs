//! Fixed-point money codec.
//!
//! Monetary values are `rust_decimal::Decimal` end to end. This module renders
//! them for people and converts them to and from integer minor units for
//! storage columns that hold whole numbers.

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest scale accepted by the minor-unit conversions.
pub const MAX_SCALE: u32 = 18;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("{amount} has more than {scale} fractional digits")]
    NotRepresentable { amount: Decimal, scale: u32 },
    #[error("{amount} does not fit in minor units at scale {scale}")]
    Overflow { amount: Decimal, scale: u32 },
    #[error("unsupported scale {0}")]
    InvalidScale(u32),
}

/// Digit grouping and decimal mark used when rendering amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberLocale {
    /// `1.234.567,89`
    Indonesian,
    /// `1,234,567.89`
    Export,
}

impl NumberLocale {
    fn separators(&self) -> (char, char) {
        match self {
            NumberLocale::Indonesian => ('.', ','),
            NumberLocale::Export => (',', '.'),
        }
    }
}

/// Renders `amount` with two fractional digits and no currency symbol.
pub fn to_display_string(amount: Decimal, locale: NumberLocale) -> String {
    let (group_sep, decimal_sep) = locale.separators();
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let text = format!("{:.2}", rounded.abs());
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(group_sep);
        }
        grouped.push(ch);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{}{}{}{}", sign, grouped, decimal_sep, frac_part)
}

/// Converts `amount` to an integer count of `10^-scale` units.
pub fn to_minor_units(amount: Decimal, scale: u32) -> Result<i64, MoneyError> {
    if scale > MAX_SCALE {
        return Err(MoneyError::InvalidScale(scale));
    }
    let factor = Decimal::from(10i64.pow(scale));
    let scaled = amount
        .checked_mul(factor)
        .ok_or(MoneyError::Overflow { amount, scale })?;
    if scaled.fract() != Decimal::ZERO {
        return Err(MoneyError::NotRepresentable { amount, scale });
    }
    scaled.to_i64().ok_or(MoneyError::Overflow { amount, scale })
}

pub fn from_minor_units(units: i64, scale: u32) -> Result<Decimal, MoneyError> {
    if scale > MAX_SCALE {
        return Err(MoneyError::InvalidScale(scale));
    }
    Ok(Decimal::new(units, scale))
}
