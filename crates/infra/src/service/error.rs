use thiserror::Error;

use loms_core::{OrderId, Sku};
use loms_events::NotifyError;
use loms_orders::OrderStatus;

use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("order {0} not found")]
    NotFound(OrderId),

    #[error("order {order_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The order exists and is now `failed`.
    #[error("order {order_id}: insufficient stock for sku {sku}: requested {requested}, missing {missing}")]
    InsufficientStock {
        order_id: OrderId,
        sku: Sku,
        requested: u64,
        missing: u64,
    },

    #[error("{step}: {source}")]
    Repository {
        step: &'static str,
        #[source]
        source: RepositoryError,
    },

    /// The state change is committed; only the notification was lost.
    #[error("order {order_id}: notification failed: {source}")]
    Notify {
        order_id: OrderId,
        #[source]
        source: NotifyError,
    },
}

impl ServiceError {
    /// Stable machine-checkable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::InsufficientStock { .. } => "insufficient_stock",
            ServiceError::Repository { source, .. } => match source {
                RepositoryError::NotFound(_) => "not_found",
                RepositoryError::Conflict(_) => "conflict",
                RepositoryError::Database(_) | RepositoryError::Decode(_) => "repository_error",
            },
            ServiceError::Notify { .. } => "notify_error",
        }
    }

    /// Order the error refers to, when one was created or addressed.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            ServiceError::NotFound(id)
            | ServiceError::InvalidTransition { order_id: id, .. }
            | ServiceError::InsufficientStock { order_id: id, .. }
            | ServiceError::Notify { order_id: id, .. } => Some(*id),
            ServiceError::Validation(_) | ServiceError::Repository { .. } => None,
        }
    }
}

/// Wrap a repository error with the name of the step that failed.
pub(crate) fn step(step: &'static str) -> impl FnOnce(RepositoryError) -> ServiceError {
    move |source| ServiceError::Repository { step, source }
}
