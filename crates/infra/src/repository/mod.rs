//! Storage boundary for orders and stock.
//!
//! The order service depends only on these traits. Two families of
//! implementations exist: in-memory (tests/dev) and Postgres (sqlx).
//!
//! Every mutating call is all-or-nothing: either all of its writes are
//! visible afterwards or none are.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use loms_core::{OrderId, Sku, UserId, WarehouseId};
use loms_orders::{Order, OrderItem, OrderStatus};
use loms_stock::{AllocationPlan, Reservation, Stock};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryOrderRepository, InMemoryStockRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Lost a race: status CAS miss, serialization failure, or a stock
    /// decrement that would go negative.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be turned back into a domain value.
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert the order with status `new` together with its items.
    async fn create_order(
        &self,
        user_id: UserId,
        items: &[OrderItem],
    ) -> Result<OrderId, RepositoryError>;

    async fn get_order(&self, order_id: OrderId) -> Result<Order, RepositoryError>;

    /// Compare-and-set the status: succeeds only if the current status is `from`.
    async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait StockRepository: Send + Sync {
    /// Per-warehouse available counts, ascending by warehouse id.
    async fn available_stocks(&self, sku: Sku) -> Result<Vec<Stock>, RepositoryError>;

    /// Decrement stock and record reservations for every take in `plan`.
    async fn reserve(
        &self,
        order_id: OrderId,
        sku: Sku,
        plan: &AllocationPlan,
    ) -> Result<(), RepositoryError>;

    /// Return every reservation of `(order_id, sku)` to stock and delete it.
    async fn unreserve(
        &self,
        order_id: OrderId,
        sku: Sku,
    ) -> Result<Vec<Reservation>, RepositoryError>;

    /// Delete every reservation of the order without restoring stock.
    async fn write_off(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError>;

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError>;

    /// Set the available count for one warehouse (seeding / restock).
    async fn put_stock(
        &self,
        sku: Sku,
        warehouse_id: WarehouseId,
        count: u64,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<R> OrderRepository for Arc<R>
where
    R: OrderRepository + ?Sized,
{
    async fn create_order(
        &self,
        user_id: UserId,
        items: &[OrderItem],
    ) -> Result<OrderId, RepositoryError> {
        (**self).create_order(user_id, items).await
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Order, RepositoryError> {
        (**self).get_order(order_id).await
    }

    async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), RepositoryError> {
        (**self).transition(order_id, from, to).await
    }
}

#[async_trait]
impl<R> StockRepository for Arc<R>
where
    R: StockRepository + ?Sized,
{
    async fn available_stocks(&self, sku: Sku) -> Result<Vec<Stock>, RepositoryError> {
        (**self).available_stocks(sku).await
    }

    async fn reserve(
        &self,
        order_id: OrderId,
        sku: Sku,
        plan: &AllocationPlan,
    ) -> Result<(), RepositoryError> {
        (**self).reserve(order_id, sku, plan).await
    }

    async fn unreserve(
        &self,
        order_id: OrderId,
        sku: Sku,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        (**self).unreserve(order_id, sku).await
    }

    async fn write_off(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError> {
        (**self).write_off(order_id).await
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError> {
        (**self).reservations(order_id).await
    }

    async fn put_stock(
        &self,
        sku: Sku,
        warehouse_id: WarehouseId,
        count: u64,
    ) -> Result<(), RepositoryError> {
        (**self).put_stock(sku, warehouse_id, count).await
    }
}
