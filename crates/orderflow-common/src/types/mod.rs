//! Common types used across orderflow

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{OrderflowError, Result};

/// A single order as served by the order source.
///
/// The source is the single writer: `id` determines every other field at any
/// point in time. Prices travel as JSON numbers but are held as exact decimals
/// so currency math never goes through binary floating point.
///
/// # Examples
///
/// ```rust
/// use orderflow_common::OrderRecord;
/// use rust_decimal::Decimal;
///
/// let order = OrderRecord::new(1, "Notebook", 2, Decimal::new(450, 2));
/// assert!(order.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Unique, stable order identifier
    pub id: i64,

    /// Item description; never empty
    pub item: String,

    /// Ordered quantity; always positive
    pub qty: i64,

    /// Unit price in the source currency (USD on the wire)
    #[serde(rename = "price_usd", with = "rust_decimal::serde::float")]
    pub price_source: Decimal,
}

impl OrderRecord {
    pub fn new(id: i64, item: impl Into<String>, qty: i64, price_source: Decimal) -> Self {
        Self {
            id,
            item: item.into(),
            qty,
            price_source,
        }
    }

    /// Check the record invariants the source is expected to uphold
    pub fn validate(&self) -> Result<()> {
        if self.item.trim().is_empty() {
            return Err(self.malformed("item must not be empty"));
        }

        if self.qty <= 0 {
            return Err(self.malformed(format!("qty must be positive, got {}", self.qty)));
        }

        if self.price_source < Decimal::ZERO {
            return Err(self.malformed(format!(
                "price must not be negative, got {}",
                self.price_source
            )));
        }

        Ok(())
    }

    fn malformed(&self, reason: impl Into<String>) -> OrderflowError {
        OrderflowError::MalformedRecord {
            id: self.id,
            reason: reason.into(),
        }
    }
}

/// The full set of orders, in the same shape as the source response
/// (`{"orders": [...]}`) and the queue message body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderBatch {
    pub orders: Vec<OrderRecord>,
}

impl OrderBatch {
    pub fn new(orders: Vec<OrderRecord>) -> Self {
        Self { orders }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Validate every record, failing on the first malformed one
    pub fn validate(&self) -> Result<()> {
        self.orders.iter().try_for_each(OrderRecord::validate)?;
        ensure_unique_ids(&self.orders)
    }

    /// Encode as the UTF-8 JSON message body
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body.
    ///
    /// Undecodable input is reported as [`OrderflowError::MalformedMessage`]
    /// so consumers can route it instead of crashing.
    pub fn from_json_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| OrderflowError::MalformedMessage(e.to_string()))
    }
}

/// Fail on the first id seen twice; a batch is one snapshot of the source,
/// so two records for one id cannot both be current.
pub fn ensure_unique_ids(orders: &[OrderRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(orders.len());
    match orders.iter().find(|order| !seen.insert(order.id)) {
        Some(dup) => Err(dup.malformed("id appears more than once in the batch")),
        None => Ok(()),
    }
}

/// Conversion rate from the source currency to the target currency.
///
/// Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct ExchangeRate(Decimal);

impl ExchangeRate {
    pub fn new(rate: Decimal) -> Result<Self> {
        if rate <= Decimal::ZERO {
            return Err(OrderflowError::config(format!(
                "exchange rate must be positive, got {}",
                rate
            )));
        }
        Ok(Self(rate))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

/// USD to EUR at 0.92
impl Default for ExchangeRate {
    fn default() -> Self {
        Self(Decimal::new(92, 2))
    }
}

impl TryFrom<Decimal> for ExchangeRate {
    type Error = OrderflowError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ExchangeRate> for Decimal {
    fn from(rate: ExchangeRate) -> Self {
        rate.0
    }
}

impl FromStr for ExchangeRate {
    type Err = OrderflowError;

    fn from_str(s: &str) -> Result<Self> {
        let rate = Decimal::from_str(s.trim())
            .map_err(|e| OrderflowError::config(format!("invalid exchange rate '{}': {}", s, e)))?;
        Self::new(rate)
    }
}

impl std::fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
