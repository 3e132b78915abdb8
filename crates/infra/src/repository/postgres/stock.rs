use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use loms_core::{OrderId, Sku, WarehouseId};
use loms_stock::{AllocationPlan, Reservation, Stock};

use super::{begin_repeatable_read, decode_error, map_sqlx_error, to_count, to_db_count};
use crate::repository::{RepositoryError, StockRepository};

/// Available stock in `stock`, held units in `reservation_stock`.
///
/// A reserved unit lives in exactly one of the two tables: reserving moves
/// it from `stock` to `reservation_stock`, unreserving moves it back, and a
/// write-off deletes it.
#[derive(Debug, Clone)]
pub struct PostgresStockRepository {
    pool: Arc<PgPool>,
}

impl PostgresStockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn sku_param(sku: Sku) -> i64 {
    i64::from(sku.get())
}

#[async_trait]
impl StockRepository for PostgresStockRepository {
    #[instrument(skip(self), fields(sku = %sku, warehouses = tracing::field::Empty), err)]
    async fn available_stocks(&self, sku: Sku) -> Result<Vec<Stock>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, count
            FROM stock
            WHERE sku = $1
            ORDER BY warehouse_id ASC
            "#,
        )
        .bind(sku_param(sku))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("available_stocks", e))?;

        let mut stocks = Vec::with_capacity(rows.len());
        for row in rows {
            let row = StockRow::from_row(&row).map_err(|e| decode_error("available_stocks", e))?;
            stocks.push(Stock::new(
                WarehouseId::new(row.warehouse_id),
                to_count("available_stocks", row.count)?,
            ));
        }

        Span::current().record("warehouses", stocks.len());
        Ok(stocks)
    }

    #[instrument(
        skip(self, plan),
        fields(order_id = %order_id, sku = %sku, total = plan.total()),
        err
    )]
    async fn reserve(
        &self,
        order_id: OrderId,
        sku: Sku,
        plan: &AllocationPlan,
    ) -> Result<(), RepositoryError> {
        if plan.is_empty() {
            return Ok(());
        }

        let mut tx = begin_repeatable_read(&self.pool, "reserve").await?;

        for take in plan.takes() {
            let count = to_db_count("reserve", take.count)?;

            // Guarded decrement: never lets the count go negative.
            let updated = sqlx::query(
                r#"
                UPDATE stock
                SET count = count - $1
                WHERE sku = $2 AND warehouse_id = $3 AND count >= $1
                "#,
            )
            .bind(count)
            .bind(sku_param(sku))
            .bind(take.warehouse_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("decrement_stock", e))?
            .rows_affected();

            if updated == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(RepositoryError::Conflict(format!(
                    "sku {sku} warehouse {}: fewer than {} units available",
                    take.warehouse_id, take.count
                )));
            }

            sqlx::query(
                r#"
                INSERT INTO reservation_stock (order_id, sku, warehouse_id, count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_id, sku, warehouse_id)
                DO UPDATE SET count = reservation_stock.count + EXCLUDED.count
                "#,
            )
            .bind(order_id.get())
            .bind(sku_param(sku))
            .bind(take.warehouse_id.get())
            .bind(count)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_reservation", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_reserve", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %order_id, sku = %sku, released = tracing::field::Empty), err)]
    async fn unreserve(
        &self,
        order_id: OrderId,
        sku: Sku,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        let mut tx = begin_repeatable_read(&self.pool, "unreserve").await?;

        let rows = sqlx::query(
            r#"
            DELETE FROM reservation_stock
            WHERE order_id = $1 AND sku = $2
            RETURNING order_id, sku, warehouse_id, count
            "#,
        )
        .bind(order_id.get())
        .bind(sku_param(sku))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_reservations", e))?;

        let released = decode_reservations("unreserve", rows)?;

        for r in &released {
            sqlx::query(
                r#"
                INSERT INTO stock (sku, warehouse_id, count)
                VALUES ($1, $2, $3)
                ON CONFLICT (sku, warehouse_id)
                DO UPDATE SET count = stock.count + EXCLUDED.count
                "#,
            )
            .bind(sku_param(r.sku))
            .bind(r.warehouse_id.get())
            .bind(to_db_count("unreserve", r.count)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("restore_stock", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_unreserve", e))?;

        Span::current().record("released", released.len());
        Ok(released)
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn write_off(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError> {
        let mut tx = begin_repeatable_read(&self.pool, "write_off").await?;

        let rows = sqlx::query(
            r#"
            DELETE FROM reservation_stock
            WHERE order_id = $1
            RETURNING order_id, sku, warehouse_id, count
            "#,
        )
        .bind(order_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("write_off", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_write_off", e))?;

        decode_reservations("write_off", rows)
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, sku, warehouse_id, count
            FROM reservation_stock
            WHERE order_id = $1
            ORDER BY sku ASC, warehouse_id ASC
            "#,
        )
        .bind(order_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservations", e))?;

        decode_reservations("reservations", rows)
    }

    #[instrument(skip(self), fields(sku = %sku, warehouse_id = %warehouse_id), err)]
    async fn put_stock(
        &self,
        sku: Sku,
        warehouse_id: WarehouseId,
        count: u64,
    ) -> Result<(), RepositoryError> {
        let mut tx = begin_repeatable_read(&self.pool, "put_stock").await?;

        sqlx::query(
            r#"
            INSERT INTO stock (sku, warehouse_id, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (sku, warehouse_id)
            DO UPDATE SET count = EXCLUDED.count
            "#,
        )
        .bind(sku_param(sku))
        .bind(warehouse_id.get())
        .bind(to_db_count("put_stock", count)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("put_stock", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_put_stock", e))?;
        Ok(())
    }
}

fn decode_reservations(
    operation: &str,
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<Reservation>, RepositoryError> {
    rows.iter()
        .map(|row| {
            let row = ReservationRow::from_row(row).map_err(|e| decode_error(operation, e))?;
            row.into_reservation(operation)
        })
        .collect()
}

// SQLx row types

#[derive(Debug)]
struct StockRow {
    warehouse_id: i64,
    count: i64,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StockRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockRow {
            warehouse_id: row.try_get("warehouse_id")?,
            count: row.try_get("count")?,
        })
    }
}

#[derive(Debug)]
struct ReservationRow {
    order_id: i64,
    sku: i64,
    warehouse_id: i64,
    count: i64,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for ReservationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ReservationRow {
            order_id: row.try_get("order_id")?,
            sku: row.try_get("sku")?,
            warehouse_id: row.try_get("warehouse_id")?,
            count: row.try_get("count")?,
        })
    }
}

impl ReservationRow {
    fn into_reservation(self, operation: &str) -> Result<Reservation, RepositoryError> {
        let sku = u32::try_from(self.sku).map_err(|e| decode_error(operation, e))?;
        Ok(Reservation {
            order_id: OrderId::new(self.order_id),
            sku: Sku::new(sku),
            warehouse_id: WarehouseId::new(self.warehouse_id),
            count: to_count(operation, self.count)?,
        })
    }
}
