//! SQLite order store
//!
//! One row per order id. A batch is upserted inside a single transaction:
//! either every row lands or none does.

use chrono::SecondsFormat;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, instrument};

use orderflow_common::config::StoreConfig;
use orderflow_common::{OrderflowError, Result};

use crate::transform::TransformedOrder;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY,
    item TEXT NOT NULL,
    qty INTEGER NOT NULL,
    price_usd REAL NOT NULL,
    price_eur REAL NOT NULL,
    inserted_at TEXT NOT NULL
)
"#;

const UPSERT: &str = r#"
INSERT INTO orders (id, item, qty, price_usd, price_eur, inserted_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(id) DO UPDATE SET
    item = excluded.item,
    qty = excluded.qty,
    price_usd = excluded.price_usd,
    price_eur = excluded.price_eur,
    inserted_at = excluded.inserted_at
"#;

/// A row of the `orders` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOrderRow {
    pub id: i64,
    pub item: String,
    pub qty: i64,
    pub price_usd: Decimal,
    pub price_eur: Decimal,
    /// RFC 3339, UTC
    pub inserted_at: String,
}

impl StoredOrderRow {
    /// Columns that depend only on the source data and the rate
    pub fn business_columns(&self) -> (i64, &str, i64, Decimal, Decimal) {
        (self.id, &self.item, self.qty, self.price_usd, self.price_eur)
    }
}

/// Inserted vs updated counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertSummary {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

pub struct OrderStore {
    pool: SqlitePool,
}

impl OrderStore {
    /// Open (creating the file if needed) and ensure the schema exists
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(store_error("open database"))?;

        let store = Self { pool };
        store.ensure_schema().await?;

        debug!("Order store ready");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(store_error("create schema"))?;
        Ok(())
    }

    /// Upsert every order in one transaction.
    ///
    /// Existing ids have every non-key column replaced. Any failure rolls the
    /// whole batch back.
    #[instrument(skip_all, fields(rows = orders.len()))]
    pub async fn upsert_batch(&self, orders: &[TransformedOrder]) -> Result<UpsertSummary> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_error("begin transaction"))?;
        let mut summary = UpsertSummary::default();

        for order in orders {
            let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE id = ?1")
                .bind(order.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_error("look up order"))?;

            sqlx::query(UPSERT)
                .bind(order.id)
                .bind(&order.item)
                .bind(order.qty)
                .bind(to_real(order.id, order.price_source)?)
                .bind(to_real(order.id, order.price_target)?)
                .bind(
                    order
                        .ingested_at
                        .to_rfc3339_opts(SecondsFormat::Micros, true),
                )
                .execute(&mut *tx)
                .await
                .map_err(|e| OrderflowError::store(format!("upsert order {}: {}", order.id, e)))?;

            if existing > 0 {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }

        tx.commit().await.map_err(store_error("commit"))?;

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            "Committed order batch"
        );
        Ok(summary)
    }

    /// All rows, ordered by id
    pub async fn fetch_all(&self) -> Result<Vec<StoredOrderRow>> {
        let rows = sqlx::query(
            "SELECT id, item, qty, price_usd, price_eur, inserted_at FROM orders ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("read orders"))?;

        rows.iter().map(read_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Option<StoredOrderRow>> {
        let row = sqlx::query(
            "SELECT id, item, qty, price_usd, price_eur, inserted_at FROM orders WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error("read order"))?;

        row.as_ref().map(read_row).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await
            .map_err(store_error("count orders"))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn store_error(action: &'static str) -> impl Fn(sqlx::Error) -> OrderflowError {
    move |e| OrderflowError::store(format!("{}: {}", action, e))
}

fn to_real(id: i64, price: Decimal) -> Result<f64> {
    price
        .to_f64()
        .ok_or_else(|| OrderflowError::store(format!("order {}: price {} is not representable", id, price)))
}

/// REAL back to decimal via the shortest round-trip text form, so 4.14
/// reads back as 4.14 rather than its binary expansion
fn from_real(value: f64) -> Result<Decimal> {
    Decimal::from_str(&value.to_string())
        .map_err(|e| OrderflowError::store(format!("stored price {} is not a decimal: {}", value, e)))
}

fn read_row(row: &SqliteRow) -> Result<StoredOrderRow> {
    let column = |e: sqlx::Error| OrderflowError::store(format!("decode row: {}", e));

    Ok(StoredOrderRow {
        id: row.try_get("id").map_err(column)?,
        item: row.try_get("item").map_err(column)?,
        qty: row.try_get("qty").map_err(column)?,
        price_usd: from_real(row.try_get("price_usd").map_err(column)?)?,
        price_eur: from_real(row.try_get("price_eur").map_err(column)?)?,
        inserted_at: row.try_get("inserted_at").map_err(column)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_real_round_trip_keeps_cents() {
        for price in [dec!(4.14), dec!(2.94), dec!(27.59), dec!(0), dec!(12), dec!(0.1)] {
            assert_eq!(from_real(to_real(1, price).unwrap()).unwrap(), price.normalize());
        }
    }

    #[test]
    fn test_summary_total() {
        let summary = UpsertSummary {
            inserted: 2,
            updated: 1,
        };
        assert_eq!(summary.total(), 3);
    }
}
