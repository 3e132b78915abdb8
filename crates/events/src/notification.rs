use serde::{Deserialize, Serialize};

use loms_core::{OrderId, UserId};
use loms_orders::OrderStatus;

pub const MSG_CREATED: &str = "order is created";
pub const MSG_AWAITING_PAYMENT: &str =
    "the order has been successfully created and is awaiting payment";
pub const MSG_PAYED: &str = "the order has been paid";
pub const MSG_CANCELLED: &str = "the order has been cancelled";
pub const MSG_FAILED: &str = "the order could not be placed";

/// Status-change message published once per order transition.
///
/// Wire form is JSON; transports key it by order id so that all messages
/// of one order land on the same partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusNotification {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub message: String,
}

impl OrderStatusNotification {
    pub fn new(
        user_id: UserId,
        order_id: OrderId,
        status: OrderStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            order_id,
            status,
            message: message.into(),
        }
    }

    pub fn failed(user_id: UserId, order_id: OrderId, reason: impl core::fmt::Display) -> Self {
        Self::new(
            user_id,
            order_id,
            OrderStatus::Failed,
            format!("no free item: {reason} for your order"),
        )
    }

    pub fn partition_key(&self) -> String {
        self.order_id.to_string()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
