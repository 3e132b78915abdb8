use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use loms_core::{OrderId, UserId};
use loms_events::OrderStatusNotification;

use super::model::{HistoryQuery, StoredMessage};
use super::repository::MessageRepository;
use crate::repository::RepositoryError;
use crate::repository::postgres::{decode_error, map_sqlx_error};

/// `message_history` table.
#[derive(Debug, Clone)]
pub struct PostgresMessageRepository {
    pool: Arc<PgPool>,
}

impl PostgresMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    #[instrument(
        skip(self, notification),
        fields(order_id = %notification.order_id, status = %notification.status),
        err
    )]
    async fn save(
        &self,
        notification: &OrderStatusNotification,
        received_at: DateTime<Utc>,
    ) -> Result<Option<i64>, RepositoryError> {
        // The existing-row branch reads the snapshot taken before the insert,
        // so it only matches rows stored by earlier attempts.
        sqlx::query_scalar(
            r#"
            WITH inserted AS (
                INSERT INTO message_history (user_id, order_id, status, message, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (order_id, status) DO NOTHING
                RETURNING id
            )
            SELECT id FROM inserted
            UNION ALL
            SELECT id FROM message_history
            WHERE order_id = $2 AND status = $3 AND NOT delivered
            LIMIT 1
            "#,
        )
        .bind(notification.user_id.get())
        .bind(notification.order_id.get())
        .bind(notification.status.as_str())
        .bind(&notification.message)
        .bind(received_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_message", e))
    }

    #[instrument(skip(self), err)]
    async fn mark_delivered(&self, id: i64) -> Result<(), RepositoryError> {
        let updated = sqlx::query("UPDATE message_history SET delivered = TRUE WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_delivered", e))?
            .rows_affected();

        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %query.user_id), err)]
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, order_id, status, message, created_at
            FROM message_history
            WHERE user_id = $1 AND created_at BETWEEN $2 AND $3
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(query.user_id.get())
        .bind(query.from)
        .bind(query.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("message_history", e))?;

        rows.iter()
            .map(|row| {
                MessageRow::from_row(row)
                    .map_err(|e| decode_error("message_history", e))?
                    .into_message()
            })
            .collect()
    }
}

#[derive(Debug)]
struct MessageRow {
    id: i64,
    user_id: i64,
    order_id: i64,
    status: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for MessageRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            order_id: row.try_get("order_id")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl MessageRow {
    fn into_message(self) -> Result<StoredMessage, RepositoryError> {
        Ok(StoredMessage {
            id: self.id,
            user_id: UserId::new(self.user_id),
            order_id: OrderId::new(self.order_id),
            status: self
                .status
                .parse()
                .map_err(|e| decode_error("message_history.status", e))?,
            message: self.message,
            created_at: self.created_at,
        })
    }
}
