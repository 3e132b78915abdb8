use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loms_core::{OrderId, UserId};
use loms_orders::OrderStatus;

/// One persisted status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// History of one user within `[from, to]` (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryQuery {
    pub user_id: UserId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl HistoryQuery {
    pub fn new(user_id: UserId, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { user_id, from, to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }
}
