use core::str::FromStr;

use serde::{Deserialize, Serialize};

use loms_core::{DomainError, DomainResult, OrderId, Sku, UserId};

/// Order status lifecycle.
///
/// ```text
/// new ──► awaiting_payment ──► payed
///  │              │
///  ▼              ▼
/// failed      cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    AwaitingPayment,
    Payed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::New,
        OrderStatus::AwaitingPayment,
        OrderStatus::Payed,
        OrderStatus::Cancelled,
        OrderStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::Payed => "payed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }

    /// `payed`, `cancelled` and `failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Payed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::New, OrderStatus::AwaitingPayment)
                | (OrderStatus::New, OrderStatus::Failed)
                | (OrderStatus::AwaitingPayment, OrderStatus::Payed)
                | (OrderStatus::AwaitingPayment, OrderStatus::Cancelled)
        )
    }

    pub fn ensure_transition(self, next: OrderStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "cannot move order from {self} to {next}"
            )))
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown order status: {s}")))
    }
}

/// Order line: product and requested quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: Sku,
    pub count: u32,
}

impl OrderItem {
    pub fn new(sku: Sku, count: u32) -> Self {
        Self { sku, count }
    }
}

/// Request to place an order (before the store assigns an id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
}

impl NewOrder {
    pub fn new(user_id: UserId, items: Vec<OrderItem>) -> Self {
        Self { user_id, items }
    }

    /// Reject empty orders and zero quantities before any state is touched.
    pub fn validate(&self) -> DomainResult<()> {
        if self.items.is_empty() {
            return Err(DomainError::validation("order must contain at least one item"));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.sku.get() == 0 {
                return Err(DomainError::validation(format!(
                    "item {idx}: sku must be positive"
                )));
            }
            if item.count == 0 {
                return Err(DomainError::validation(format!(
                    "item {idx}: count must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// A placed order as persisted by the order store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    items: Vec<OrderItem>,
    status: OrderStatus,
}

impl Order {
    pub fn new(id: OrderId, user_id: UserId, items: Vec<OrderItem>, status: OrderStatus) -> Self {
        Self {
            id,
            user_id,
            items,
            status,
        }
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Move to `next`, enforcing the lifecycle. Items are never touched.
    pub fn transition_to(&mut self, next: OrderStatus) -> DomainResult<()> {
        self.status.ensure_transition(next)?;
        self.status = next;
        Ok(())
    }
}
