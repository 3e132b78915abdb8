use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use loms_core::UserId;
use loms_events::OrderStatusNotification;

use super::cache::LruCache;
use super::model::{HistoryQuery, StoredMessage};
use super::repository::MessageRepository;
use crate::repository::RepositoryError;

#[derive(Debug, Error)]
#[error("chat delivery failed: {0}")]
pub struct ChatError(pub String);

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

/// Downstream messenger the rendered text is delivered to.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_message(&self, user_id: UserId, text: &str) -> Result<(), ChatError>;
}

#[async_trait]
impl<C> ChatSink for Arc<C>
where
    C: ChatSink + ?Sized,
{
    async fn send_message(&self, user_id: UserId, text: &str) -> Result<(), ChatError> {
        (**self).send_message(user_id, text).await
    }
}

/// Writes messages to the log instead of a messenger.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChatSink;

#[async_trait]
impl ChatSink for TracingChatSink {
    async fn send_message(&self, user_id: UserId, text: &str) -> Result<(), ChatError> {
        info!(user_id = %user_id, text, "chat message");
        Ok(())
    }
}

pub fn render(notification: &OrderStatusNotification) -> String {
    format!(
        "Your id: {}, your order: {} have the following status: {}. More information: {}",
        notification.user_id, notification.order_id, notification.status, notification.message
    )
}

pub struct NotificationService<R, C> {
    messages: R,
    chat: C,
    history_cache: Mutex<LruCache<HistoryQuery, Vec<StoredMessage>>>,
}

impl<R, C> NotificationService<R, C>
where
    R: MessageRepository,
    C: ChatSink,
{
    pub fn new(messages: R, chat: C, cache_capacity: usize) -> Self {
        Self {
            messages,
            chat,
            history_cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// Persist the message; `None` when it was already stored and delivered.
    pub async fn save(
        &self,
        notification: &OrderStatusNotification,
    ) -> Result<Option<i64>, NotificationError> {
        Ok(self.messages.save(notification, Utc::now()).await?)
    }

    pub async fn notify_user(
        &self,
        notification: &OrderStatusNotification,
    ) -> Result<(), NotificationError> {
        let text = render(notification);
        self.chat.send_message(notification.user_id, &text).await?;
        Ok(())
    }

    /// Save, then forward to chat unless an earlier attempt already did.
    ///
    /// The message counts as delivered only once the chat send succeeded,
    /// so a redelivery after a failed send retries it. Returns whether
    /// chat was sent by this call.
    #[instrument(
        skip(self, notification),
        fields(order_id = %notification.order_id, status = %notification.status),
        err
    )]
    pub async fn handle(
        &self,
        notification: &OrderStatusNotification,
    ) -> Result<bool, NotificationError> {
        match self.save(notification).await? {
            Some(id) => {
                self.forget_history(notification.user_id);
                self.notify_user(notification).await?;
                self.messages.mark_delivered(id).await?;
                debug!(message_id = id, "message delivered");
                Ok(true)
            }
            None => {
                debug!("duplicate message skipped");
                Ok(false)
            }
        }
    }

    /// User history through the LRU cache. Empty results are not cached.
    #[instrument(skip(self), fields(user_id = %query.user_id), err)]
    pub async fn get_history(
        &self,
        query: HistoryQuery,
    ) -> Result<Vec<StoredMessage>, NotificationError> {
        if let Some(hit) = self.cached(&query) {
            debug!(messages = hit.len(), "history cache hit");
            return Ok(hit);
        }

        let rows = self.messages.history(&query).await?;
        if !rows.is_empty() {
            if let Ok(mut cache) = self.history_cache.lock() {
                cache.put(query, rows.clone());
            }
        }
        Ok(rows)
    }

    fn cached(&self, query: &HistoryQuery) -> Option<Vec<StoredMessage>> {
        let mut cache = self.history_cache.lock().ok()?;
        cache.get(query).cloned()
    }

    /// Cached windows of this user may miss a newly stored message.
    fn forget_history(&self, user_id: UserId) {
        if let Ok(mut cache) = self.history_cache.lock() {
            cache.retain(|query| query.user_id != user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::InMemoryMessageRepository;
    use chrono::Duration;
    use loms_core::OrderId;
    use loms_orders::OrderStatus;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send_message(&self, _user_id: UserId, text: &str) -> Result<(), ChatError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn test_notification(status: OrderStatus) -> OrderStatusNotification {
        OrderStatusNotification::new(UserId::new(7), OrderId::new(3), status, "details")
    }

    #[test]
    fn renders_user_facing_text() {
        let text = render(&test_notification(OrderStatus::Payed));
        assert_eq!(
            text,
            "Your id: 7, your order: 3 have the following status: payed. More information: details"
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_is_saved_and_sent_once() {
        let sink = Arc::new(RecordingSink::default());
        let service = NotificationService::new(InMemoryMessageRepository::new(), sink.clone(), 8);

        assert!(service.handle(&test_notification(OrderStatus::New)).await.unwrap());
        assert!(!service.handle(&test_notification(OrderStatus::New)).await.unwrap());
        assert!(service.handle(&test_notification(OrderStatus::Failed)).await.unwrap());

        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    /// Fails the first `failures` sends and counts the rest.
    #[derive(Default)]
    struct FlakySink {
        failures: Mutex<u32>,
        sent: Mutex<u32>,
    }

    #[async_trait]
    impl ChatSink for FlakySink {
        async fn send_message(&self, _user_id: UserId, _text: &str) -> Result<(), ChatError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChatError("transient".to_string()));
            }
            *self.sent.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_chat_send_is_retried_on_redelivery() {
        let sink = Arc::new(FlakySink::default());
        *sink.failures.lock().unwrap() = 1;
        let repo = Arc::new(InMemoryMessageRepository::new());
        let service = NotificationService::new(repo.clone(), sink.clone(), 8);
        let notification = test_notification(OrderStatus::Payed);

        assert!(service.handle(&notification).await.is_err());
        assert_eq!(*sink.sent.lock().unwrap(), 0);

        assert!(service.handle(&notification).await.unwrap());
        assert_eq!(*sink.sent.lock().unwrap(), 1);

        // Delivered now: further redeliveries are duplicates.
        assert!(!service.handle(&notification).await.unwrap());
        assert_eq!(*sink.sent.lock().unwrap(), 1);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn empty_history_is_not_cached() {
        let service = NotificationService::new(InMemoryMessageRepository::new(), TracingChatSink, 8);
        let now = Utc::now();
        let query = HistoryQuery::new(
            UserId::new(7),
            now - Duration::hours(1),
            now + Duration::hours(1),
        );

        assert!(service.get_history(query).await.unwrap().is_empty());

        service.handle(&test_notification(OrderStatus::New)).await.unwrap();
        assert_eq!(service.get_history(query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_message_refreshes_cached_history_of_its_user() {
        let repo = Arc::new(InMemoryMessageRepository::new());
        let service = NotificationService::new(repo.clone(), TracingChatSink, 8);
        let now = Utc::now();
        let window = |user: i64| {
            HistoryQuery::new(
                UserId::new(user),
                now - Duration::hours(1),
                now + Duration::hours(1),
            )
        };

        let other = OrderStatusNotification::new(UserId::new(8), OrderId::new(4), OrderStatus::New, "x");
        service.handle(&other).await.unwrap();
        service.handle(&test_notification(OrderStatus::New)).await.unwrap();
        assert_eq!(service.get_history(window(7)).await.unwrap().len(), 1);
        assert_eq!(service.get_history(window(8)).await.unwrap().len(), 1);

        service
            .handle(&test_notification(OrderStatus::AwaitingPayment))
            .await
            .unwrap();
        assert_eq!(service.get_history(window(7)).await.unwrap().len(), 2);
        assert_eq!(repo.len(), 3);
    }
}
