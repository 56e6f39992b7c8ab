//! Currency transform
//!
//! `price_target = price_source * rate`, rounded half-even to 2 decimal places.
//! All arithmetic is exact decimal; binary floats only appear at the store
//! boundary.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use orderflow_common::types::ensure_unique_ids;
use orderflow_common::{ExchangeRate, OrderRecord, OrderflowError, Result};

/// Decimal places kept in the target currency
pub const TARGET_SCALE: u32 = 2;

/// An order ready to load, created fresh on every run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedOrder {
    pub id: i64,
    pub item: String,
    pub qty: i64,
    pub price_source: Decimal,
    pub price_target: Decimal,
    pub ingested_at: DateTime<Utc>,
}

/// Convert a source-currency price, rounding half-even to cents.
///
/// Returns `None` only if the product overflows `Decimal`.
///
/// ```rust
/// use orderflow_common::ExchangeRate;
/// use orderflow_etl::transform::convert_price;
/// use rust_decimal::Decimal;
///
/// let rate: ExchangeRate = "0.92".parse().unwrap();
/// assert_eq!(convert_price(Decimal::new(450, 2), rate), Some(Decimal::new(414, 2)));
/// ```
pub fn convert_price(price: Decimal, rate: ExchangeRate) -> Option<Decimal> {
    price
        .checked_mul(rate.value())
        .map(|p| p.round_dp_with_strategy(TARGET_SCALE, RoundingStrategy::MidpointNearestEven))
}

/// Validate and convert one record
pub fn transform_order(
    order: &OrderRecord,
    rate: ExchangeRate,
    ingested_at: DateTime<Utc>,
) -> Result<TransformedOrder> {
    order.validate()?;

    let price_target =
        convert_price(order.price_source, rate).ok_or_else(|| OrderflowError::MalformedRecord {
            id: order.id,
            reason: format!("price {} overflows at rate {}", order.price_source, rate),
        })?;

    Ok(TransformedOrder {
        id: order.id,
        item: order.item.clone(),
        qty: order.qty,
        price_source: order.price_source,
        price_target,
        ingested_at,
    })
}

/// Transform a whole batch with one shared timestamp.
///
/// Fails on the first malformed record or repeated id, before anything is
/// loaded.
pub fn transform(
    orders: &[OrderRecord],
    rate: ExchangeRate,
    ingested_at: DateTime<Utc>,
) -> Result<Vec<TransformedOrder>> {
    ensure_unique_ids(orders)?;

    orders
        .iter()
        .map(|order| transform_order(order, rate, ingested_at))
        .collect()
}
