//! Stream consumer loop for order status notifications.
//!
//! Delivery is at-least-once: a message is acknowledged only after it was
//! stored and forwarded (or recognised as a duplicate). Messages that
//! cannot be decoded are acknowledged right away; messages that keep
//! failing are dead-lettered after `max_attempts` deliveries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loms_events::{InMemorySubscription, OrderStatusNotification};

use super::repository::MessageRepository;
use super::service::{ChatSink, NotificationService};

/// One raw message as read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("stream command error: {0}")]
    Command(String),

    #[error("stream closed")]
    Closed,
}

/// Source of notification deliveries with explicit acknowledgement.
#[async_trait]
pub trait NotificationStream: Send + Sync {
    /// Next batch; unacknowledged deliveries come back on later calls.
    async fn next_batch(&self) -> Result<Vec<Delivery>, StreamError>;

    async fn ack(&self, ids: &[String]) -> Result<(), StreamError>;

    /// Park a message that keeps failing. Default: just acknowledge it.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), StreamError> {
        warn!(message_id = %delivery.id, reason, "dropping message");
        self.ack(std::slice::from_ref(&delivery.id)).await
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Pause after a failed or empty round
    pub idle_backoff: Duration,
    /// Deliveries before a message is dead-lettered
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "notification-worker".to_string(),
            idle_backoff: Duration::from_millis(200),
            max_attempts: 5,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// Counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub poison: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

pub struct NotificationWorker<S, R, C> {
    stream: S,
    service: Arc<NotificationService<R, C>>,
    config: WorkerConfig,
    attempts: Mutex<HashMap<String, u32>>,
    stats: Mutex<WorkerStats>,
}

impl<S, R, C> NotificationWorker<S, R, C>
where
    S: NotificationStream,
    R: MessageRepository,
    C: ChatSink,
{
    pub fn new(stream: S, service: Arc<NotificationService<R, C>>, config: WorkerConfig) -> Self {
        Self {
            stream,
            service,
            config,
            attempts: Mutex::new(HashMap::new()),
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub async fn stats(&self) -> WorkerStats {
        *self.stats.lock().await
    }

    /// Consume until `cancel` fires. Returns the final counters.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerStats {
        info!(worker = %self.config.name, "notification worker started");

        loop {
            let round = tokio::select! {
                _ = cancel.cancelled() => break,
                round = self.process_batch() => round,
            };

            let pause = match round {
                Ok(0) => true,
                Ok(_) => false,
                Err(StreamError::Closed) => {
                    info!(worker = %self.config.name, "stream closed");
                    break;
                }
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "failed to read notifications");
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                }
            }
        }

        let stats = self.stats().await;
        info!(worker = %self.config.name, ?stats, "notification worker stopped");
        stats
    }

    /// Read and handle one batch. Returns how many messages were acknowledged.
    pub async fn process_batch(&self) -> Result<usize, StreamError> {
        let batch = self.stream.next_batch().await?;
        let mut acked = Vec::with_capacity(batch.len());

        for delivery in &batch {
            self.bump(|s| s.received += 1).await;

            let notification = match OrderStatusNotification::from_json(&delivery.payload) {
                Ok(n) => n,
                Err(e) => {
                    warn!(message_id = %delivery.id, error = %e, "undecodable notification");
                    self.bump(|s| s.poison += 1).await;
                    acked.push(delivery.id.clone());
                    continue;
                }
            };

            match self.service.handle(&notification).await {
                Ok(true) => {
                    self.bump(|s| s.delivered += 1).await;
                    acked.push(delivery.id.clone());
                }
                Ok(false) => {
                    self.bump(|s| s.duplicates += 1).await;
                    acked.push(delivery.id.clone());
                }
                Err(e) => {
                    self.bump(|s| s.failed += 1).await;
                    let attempt = self.record_attempt(&delivery.id).await;
                    if attempt >= self.config.max_attempts {
                        self.stream.dead_letter(delivery, &e.to_string()).await?;
                        self.forget(&delivery.id).await;
                        self.bump(|s| s.dead_lettered += 1).await;
                    } else {
                        debug!(message_id = %delivery.id, attempt, error = %e, "will retry");
                    }
                }
            }
        }

        if !acked.is_empty() {
            self.stream.ack(&acked).await?;
            for id in &acked {
                self.forget(id).await;
            }
        }
        Ok(acked.len())
    }

    async fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut *self.stats.lock().await);
    }

    async fn record_attempt(&self, id: &str) -> u32 {
        let mut attempts = self.attempts.lock().await;
        let n = attempts.entry(id.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    async fn forget(&self, id: &str) {
        self.attempts.lock().await.remove(id);
    }
}

#[derive(Debug, Default)]
struct InFlight {
    next_id: u64,
    unacked: Vec<Delivery>,
}

/// Stream over an in-process subscription, with redelivery of anything
/// not acknowledged.
pub struct InMemoryStream {
    subscription: Mutex<InMemorySubscription>,
    injected: Mutex<Vec<String>>,
    in_flight: Mutex<InFlight>,
    wait: Duration,
}

impl InMemoryStream {
    pub fn new(subscription: InMemorySubscription) -> Self {
        Self {
            subscription: Mutex::new(subscription),
            injected: Mutex::new(Vec::new()),
            in_flight: Mutex::new(InFlight::default()),
            wait: Duration::from_millis(50),
        }
    }

    /// Queue a raw payload as if another producer had written it.
    pub async fn push_raw(&self, payload: impl Into<String>) {
        self.injected.lock().await.push(payload.into());
    }

    pub async fn unacked(&self) -> usize {
        self.in_flight.lock().await.unacked.len()
    }
}

#[async_trait]
impl NotificationStream for InMemoryStream {
    async fn next_batch(&self) -> Result<Vec<Delivery>, StreamError> {
        {
            let in_flight = self.in_flight.lock().await;
            if !in_flight.unacked.is_empty() {
                return Ok(in_flight.unacked.clone());
            }
        }

        let mut payloads: Vec<String> = std::mem::take(&mut *self.injected.lock().await);
        {
            let mut sub = self.subscription.lock().await;
            for n in sub.drain() {
                payloads.push(
                    n.to_json()
                        .map_err(|e| StreamError::Command(e.to_string()))?,
                );
            }
            if payloads.is_empty() {
                match tokio::time::timeout(self.wait, sub.recv()).await {
                    Ok(Some(n)) => payloads.push(
                        n.to_json()
                            .map_err(|e| StreamError::Command(e.to_string()))?,
                    ),
                    Ok(None) => return Err(StreamError::Closed),
                    Err(_) => {}
                }
            }
        }

        let mut in_flight = self.in_flight.lock().await;
        let mut batch = Vec::with_capacity(payloads.len());
        for payload in payloads {
            in_flight.next_id += 1;
            batch.push(Delivery {
                id: format!("{}-0", in_flight.next_id),
                payload,
            });
        }
        in_flight.unacked.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn ack(&self, ids: &[String]) -> Result<(), StreamError> {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.unacked.retain(|d| !ids.contains(&d.id));
        Ok(())
    }
}
