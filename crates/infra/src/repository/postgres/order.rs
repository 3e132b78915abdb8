use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use loms_core::{OrderId, Sku, UserId};
use loms_orders::{Order, OrderItem, OrderStatus};

use super::{begin_repeatable_read, decode_error, map_sqlx_error};
use crate::repository::{OrderRepository, RepositoryError};

/// Orders and their items in `orders` / `order_item`.
#[derive(Debug, Clone)]
pub struct PostgresOrderRepository {
    pool: Arc<PgPool>,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    #[instrument(
        skip(self, items),
        fields(user_id = %user_id, item_count = items.len(), order_id = tracing::field::Empty),
        err
    )]
    async fn create_order(
        &self,
        user_id: UserId,
        items: &[OrderItem],
    ) -> Result<OrderId, RepositoryError> {
        let mut tx = begin_repeatable_read(&self.pool, "create_order").await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (user_id, status)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(user_id.get())
        .bind(OrderStatus::New.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for (line_no, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_item (order_id, line_no, sku, count)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(line_no as i32)
            .bind(i64::from(item.sku.get()))
            .bind(i64::from(item.count))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_create_order", e))?;

        Span::current().record("order_id", id);
        Ok(OrderId::new(id))
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn get_order(&self, order_id: OrderId) -> Result<Order, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_order", e))?
        .ok_or_else(|| RepositoryError::NotFound(format!("order {order_id}")))?;

        let header = OrderRow::from_row(&row).map_err(|e| decode_error("get_order", e))?;

        let item_rows = sqlx::query(
            r#"
            SELECT sku, count
            FROM order_item
            WHERE order_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(order_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_order_items", e))?;

        let mut items = Vec::with_capacity(item_rows.len());
        for row in item_rows {
            let item = OrderItemRow::from_row(&row).map_err(|e| decode_error("get_order_items", e))?;
            items.push(OrderItem::try_from(item)?);
        }

        header.into_order(items)
    }

    #[instrument(skip(self), fields(order_id = %order_id, from = %from, to = %to), err)]
    async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), RepositoryError> {
        from.ensure_transition(to)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;

        let mut tx = begin_repeatable_read(&self.pool, "transition").await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id.get())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_order_status", e))?
        .rows_affected();

        if updated == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
                    .bind(order_id.get())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("check_order_status", e))?;

            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;

            return Err(match current {
                Some(status) => RepositoryError::Conflict(format!(
                    "order {order_id} is {status}, expected {from}"
                )),
                None => RepositoryError::NotFound(format!("order {order_id}")),
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transition", e))?;
        Ok(())
    }
}

// SQLx row types

#[derive(Debug)]
struct OrderRow {
    id: i64,
    user_id: i64,
    status: String,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OrderRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
        })
    }
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Result<Order, RepositoryError> {
        let status: OrderStatus = self
            .status
            .parse()
            .map_err(|e| decode_error("get_order", e))?;
        Ok(Order::new(
            OrderId::new(self.id),
            UserId::new(self.user_id),
            items,
            status,
        ))
    }
}

#[derive(Debug)]
struct OrderItemRow {
    sku: i64,
    count: i64,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OrderItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderItemRow {
            sku: row.try_get("sku")?,
            count: row.try_get("count")?,
        })
    }
}

impl TryFrom<OrderItemRow> for OrderItem {
    type Error = RepositoryError;

    fn try_from(row: OrderItemRow) -> Result<Self, Self::Error> {
        let sku = u32::try_from(row.sku).map_err(|e| decode_error("order_item.sku", e))?;
        let count = u32::try_from(row.count).map_err(|e| decode_error("order_item.count", e))?;
        Ok(OrderItem::new(Sku::new(sku), count))
    }
}
