use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    failed: AtomicU64,
    awaiting_payment: AtomicU64,
    payed: AtomicU64,
    cancelled: AtomicU64,
    notification_failures: AtomicU64,
}

/// Shared, cloneable metrics handle.
///
/// Constructed by the caller and injected into the services that record
/// into it; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct OrderMetrics {
    inner: Arc<Counters>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub orders_created: u64,
    pub orders_failed: u64,
    pub orders_awaiting_payment: u64,
    pub orders_payed: u64,
    pub orders_cancelled: u64,
    pub notification_failures: u64,
}

impl OrderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_created(&self) {
        self.inner.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn order_failed(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn order_awaiting_payment(&self) {
        self.inner.awaiting_payment.fetch_add(1, Ordering::Relaxed);
    }

    pub fn order_payed(&self) {
        self.inner.payed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn order_cancelled(&self) {
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.inner.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner;
        MetricsSnapshot {
            orders_created: c.created.load(Ordering::Relaxed),
            orders_failed: c.failed.load(Ordering::Relaxed),
            orders_awaiting_payment: c.awaiting_payment.load(Ordering::Relaxed),
            orders_payed: c.payed.load(Ordering::Relaxed),
            orders_cancelled: c.cancelled.load(Ordering::Relaxed),
            notification_failures: c.notification_failures.load(Ordering::Relaxed),
        }
    }
}
