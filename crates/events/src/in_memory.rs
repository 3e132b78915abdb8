//! In-memory notifier for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::notification::OrderStatusNotification;
use crate::notifier::{Notifier, NotifyError};

/// Receiving half handed out by [`InMemoryNotifier::subscribe`].
#[derive(Debug)]
pub struct InMemorySubscription {
    receiver: mpsc::UnboundedReceiver<OrderStatusNotification>,
}

impl InMemorySubscription {
    pub async fn recv(&mut self) -> Option<OrderStatusNotification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OrderStatusNotification> {
        self.receiver.try_recv().ok()
    }

    /// Everything published so far, without waiting.
    pub fn drain(&mut self) -> Vec<OrderStatusNotification> {
        let mut out = Vec::new();
        while let Ok(n) = self.receiver.try_recv() {
            out.push(n);
        }
        out
    }
}

/// Broadcast fan-out: each subscriber gets a copy of every notification.
///
/// Dropped subscribers are pruned on the next send. Sending with no
/// subscribers succeeds.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<OrderStatusNotification>>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> InMemorySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(_) => tracing::warn!("in-memory notifier lock poisoned; subscription is inert"),
        }
        InMemorySubscription { receiver: rx }
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, notification: OrderStatusNotification) -> Result<(), NotifyError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| NotifyError::Transport("lock poisoned".to_string()))?;

        subs.retain(|tx| tx.send(notification.clone()).is_ok());
        Ok(())
    }
}
