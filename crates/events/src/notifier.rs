//! Publishing boundary for order status notifications.
//!
//! Delivery is at-least-once: a transport may hand the same message to a
//! consumer more than once, and consumers deduplicate on
//! `(order_id, status)`. A failed `send` is reported to the caller; the
//! order state change that triggered it is never rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::notification::OrderStatusNotification;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode notification: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notifier is closed")]
    Closed,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: OrderStatusNotification) -> Result<(), NotifyError>;

    /// Sends each notification in order; stops at the first failure.
    async fn send_all(
        &self,
        notifications: Vec<OrderStatusNotification>,
    ) -> Result<(), NotifyError> {
        for notification in notifications {
            self.send(notification).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn send(&self, notification: OrderStatusNotification) -> Result<(), NotifyError> {
        (**self).send(notification).await
    }

    async fn send_all(
        &self,
        notifications: Vec<OrderStatusNotification>,
    ) -> Result<(), NotifyError> {
        (**self).send_all(notifications).await
    }
}
