use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use loms_core::OrderId;
use loms_events::OrderStatusNotification;
use loms_orders::OrderStatus;

use super::model::{HistoryQuery, StoredMessage};
use crate::repository::RepositoryError;

/// Storage for delivered status messages.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Store the message once per `(order_id, status)`.
    ///
    /// Returns the row id while the message still awaits chat delivery,
    /// whether it was stored now or by an earlier attempt; `None` once it
    /// has been delivered.
    async fn save(
        &self,
        notification: &OrderStatusNotification,
        received_at: DateTime<Utc>,
    ) -> Result<Option<i64>, RepositoryError>;

    async fn mark_delivered(&self, id: i64) -> Result<(), RepositoryError>;

    /// Messages of one user in the query window, oldest first.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, RepositoryError>;
}

#[async_trait]
impl<R> MessageRepository for Arc<R>
where
    R: MessageRepository + ?Sized,
{
    async fn save(
        &self,
        notification: &OrderStatusNotification,
        received_at: DateTime<Utc>,
    ) -> Result<Option<i64>, RepositoryError> {
        (**self).save(notification, received_at).await
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), RepositoryError> {
        (**self).mark_delivered(id).await
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, RepositoryError> {
        (**self).history(query).await
    }
}

#[derive(Debug, Default)]
struct MessageTable {
    rows: Vec<StoredMessage>,
    seen: HashMap<(OrderId, OrderStatus), i64>,
    delivered: HashSet<i64>,
}

#[derive(Debug, Default)]
pub struct InMemoryMessageRepository {
    inner: RwLock<MessageTable>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn save(
        &self,
        notification: &OrderStatusNotification,
        received_at: DateTime<Utc>,
    ) -> Result<Option<i64>, RepositoryError> {
        let mut table = self
            .inner
            .write()
            .map_err(|_| RepositoryError::Database("lock poisoned".to_string()))?;

        let key = (notification.order_id, notification.status);
        if let Some(&id) = table.seen.get(&key) {
            return Ok((!table.delivered.contains(&id)).then_some(id));
        }

        let id = table.rows.len() as i64 + 1;
        table.seen.insert(key, id);
        table.rows.push(StoredMessage {
            id,
            user_id: notification.user_id,
            order_id: notification.order_id,
            status: notification.status,
            message: notification.message.clone(),
            created_at: received_at,
        });
        Ok(Some(id))
    }

    async fn mark_delivered(&self, id: i64) -> Result<(), RepositoryError> {
        let mut table = self
            .inner
            .write()
            .map_err(|_| RepositoryError::Database("lock poisoned".to_string()))?;

        if !table.rows.iter().any(|m| m.id == id) {
            return Err(RepositoryError::NotFound(format!("message {id}")));
        }
        table.delivered.insert(id);
        Ok(())
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, RepositoryError> {
        let table = self
            .inner
            .read()
            .map_err(|_| RepositoryError::Database("lock poisoned".to_string()))?;

        let mut rows: Vec<StoredMessage> = table
            .rows
            .iter()
            .filter(|m| m.user_id == query.user_id && query.contains(m.created_at))
            .cloned()
            .collect();
        rows.sort_by_key(|m| (m.created_at, m.id));
        Ok(rows)
    }
}
