//! In-memory repositories for tests/dev.
//!
//! One lock per repository gives every call the same all-or-nothing
//! behaviour the Postgres transactions provide.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use loms_core::{OrderId, Sku, UserId, WarehouseId};
use loms_orders::{Order, OrderItem, OrderStatus};
use loms_stock::{AllocationPlan, Reservation, Stock};

use super::{OrderRepository, RepositoryError, StockRepository};

fn poisoned() -> RepositoryError {
    RepositoryError::Database("lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct OrderTable {
    next_id: i64,
    rows: HashMap<OrderId, Order>,
}

#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    inner: RwLock<OrderTable>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create_order(
        &self,
        user_id: UserId,
        items: &[OrderItem],
    ) -> Result<OrderId, RepositoryError> {
        let mut table = self.inner.write().map_err(|_| poisoned())?;
        table.next_id += 1;
        let order_id = OrderId::new(table.next_id);
        table.rows.insert(
            order_id,
            Order::new(order_id, user_id, items.to_vec(), OrderStatus::New),
        );
        Ok(order_id)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Order, RepositoryError> {
        let table = self.inner.read().map_err(|_| poisoned())?;
        table
            .rows
            .get(&order_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("order {order_id}")))
    }

    async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), RepositoryError> {
        let mut table = self.inner.write().map_err(|_| poisoned())?;
        let order = table
            .rows
            .get_mut(&order_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("order {order_id}")))?;

        if order.status() != from {
            return Err(RepositoryError::Conflict(format!(
                "order {order_id} is {}, expected {from}",
                order.status()
            )));
        }
        order
            .transition_to(to)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))
    }
}

type ReservationKey = (OrderId, Sku, WarehouseId);

#[derive(Debug, Default)]
struct StockLedger {
    available: HashMap<Sku, BTreeMap<WarehouseId, u64>>,
    reserved: BTreeMap<ReservationKey, u64>,
}

impl StockLedger {
    fn take_reservations(&mut self, matches: impl Fn(&ReservationKey) -> bool) -> Vec<Reservation> {
        let keys: Vec<ReservationKey> = self
            .reserved
            .keys()
            .filter(|k| matches(*k))
            .copied()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let (order_id, sku, warehouse_id) = key;
                self.reserved.remove(&key).map(|count| Reservation {
                    order_id,
                    sku,
                    warehouse_id,
                    count,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStockRepository {
    inner: RwLock<StockLedger>,
}

impl InMemoryStockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of available counts for `sku` across warehouses.
    pub fn total_available(&self, sku: Sku) -> u64 {
        self.inner
            .read()
            .map(|ledger| {
                ledger
                    .available
                    .get(&sku)
                    .map(|w| w.values().sum())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl StockRepository for InMemoryStockRepository {
    async fn available_stocks(&self, sku: Sku) -> Result<Vec<Stock>, RepositoryError> {
        let ledger = self.inner.read().map_err(|_| poisoned())?;
        Ok(ledger
            .available
            .get(&sku)
            .map(|warehouses| {
                warehouses
                    .iter()
                    .map(|(id, count)| Stock::new(*id, *count))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reserve(
        &self,
        order_id: OrderId,
        sku: Sku,
        plan: &AllocationPlan,
    ) -> Result<(), RepositoryError> {
        let mut ledger = self.inner.write().map_err(|_| poisoned())?;

        // Check every take before mutating anything.
        {
            let warehouses = ledger.available.get(&sku);
            for take in plan.takes() {
                let have = warehouses
                    .and_then(|w| w.get(&take.warehouse_id))
                    .copied()
                    .unwrap_or(0);
                if have < take.count {
                    return Err(RepositoryError::Conflict(format!(
                        "sku {sku} warehouse {}: available {have}, requested {}",
                        take.warehouse_id, take.count
                    )));
                }
            }
        }

        for take in plan.takes() {
            if let Some(count) = ledger
                .available
                .get_mut(&sku)
                .and_then(|w| w.get_mut(&take.warehouse_id))
            {
                *count -= take.count;
            }
            *ledger
                .reserved
                .entry((order_id, sku, take.warehouse_id))
                .or_insert(0) += take.count;
        }
        Ok(())
    }

    async fn unreserve(
        &self,
        order_id: OrderId,
        sku: Sku,
    ) -> Result<Vec<Reservation>, RepositoryError> {
        let mut ledger = self.inner.write().map_err(|_| poisoned())?;
        let released = ledger.take_reservations(|(o, s, _)| *o == order_id && *s == sku);

        let warehouses = ledger.available.entry(sku).or_default();
        for r in &released {
            *warehouses.entry(r.warehouse_id).or_insert(0) += r.count;
        }
        Ok(released)
    }

    async fn write_off(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError> {
        let mut ledger = self.inner.write().map_err(|_| poisoned())?;
        Ok(ledger.take_reservations(|(o, _, _)| *o == order_id))
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>, RepositoryError> {
        let ledger = self.inner.read().map_err(|_| poisoned())?;
        Ok(ledger
            .reserved
            .iter()
            .filter(|((o, _, _), _)| *o == order_id)
            .map(|(&(order_id, sku, warehouse_id), &count)| Reservation {
                order_id,
                sku,
                warehouse_id,
                count,
            })
            .collect())
    }

    async fn put_stock(
        &self,
        sku: Sku,
        warehouse_id: WarehouseId,
        count: u64,
    ) -> Result<(), RepositoryError> {
        let mut ledger = self.inner.write().map_err(|_| poisoned())?;
        ledger
            .available
            .entry(sku)
            .or_default()
            .insert(warehouse_id, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loms_stock::allocate;

    fn sku() -> Sku {
        Sku::new(42)
    }

    async fn seeded() -> InMemoryStockRepository {
        let repo = InMemoryStockRepository::new();
        // Inserted out of order on purpose: reads come back by warehouse id.
        repo.put_stock(sku(), WarehouseId::new(2), 50).await.unwrap();
        repo.put_stock(sku(), WarehouseId::new(1), 200).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn available_stocks_are_sorted_by_warehouse() {
        let repo = seeded().await;
        let stocks = repo.available_stocks(sku()).await.unwrap();
        assert_eq!(
            stocks,
            vec![
                Stock::new(WarehouseId::new(1), 200),
                Stock::new(WarehouseId::new(2), 50)
            ]
        );
        assert!(repo.available_stocks(Sku::new(7)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reserve_then_unreserve_restores_stock() {
        let repo = seeded().await;
        let order = OrderId::new(1);
        let plan = allocate(210, &repo.available_stocks(sku()).await.unwrap()).unwrap();

        repo.reserve(order, sku(), &plan).await.unwrap();
        assert_eq!(repo.total_available(sku()), 40);
        assert_eq!(repo.reservations(order).await.unwrap().len(), 2);

        let released = repo.unreserve(order, sku()).await.unwrap();
        assert_eq!(released.iter().map(|r| r.count).sum::<u64>(), 210);
        assert_eq!(repo.total_available(sku()), 250);
        assert!(repo.reservations(order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reserve_over_available_is_a_conflict_and_changes_nothing() {
        let repo = seeded().await;
        let stale = allocate(
            60,
            &[
                Stock::new(WarehouseId::new(1), 10),
                Stock::new(WarehouseId::new(2), 50),
            ],
        )
        .unwrap();
        repo.put_stock(sku(), WarehouseId::new(2), 5).await.unwrap();

        let err = repo.reserve(OrderId::new(1), sku(), &stale).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.total_available(sku()), 205);
        assert!(repo.reservations(OrderId::new(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_off_keeps_stock_decremented() {
        let repo = seeded().await;
        let order = OrderId::new(3);
        let plan = allocate(10, &repo.available_stocks(sku()).await.unwrap()).unwrap();
        repo.reserve(order, sku(), &plan).await.unwrap();

        let written_off = repo.write_off(order).await.unwrap();
        assert_eq!(written_off.len(), 1);
        assert_eq!(repo.total_available(sku()), 240);
        assert!(repo.write_off(order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let repo = InMemoryOrderRepository::new();
        let id = repo
            .create_order(UserId::new(1), &[OrderItem::new(sku(), 1)])
            .await
            .unwrap();

        repo.transition(id, OrderStatus::New, OrderStatus::AwaitingPayment)
            .await
            .unwrap();
        let err = repo
            .transition(id, OrderStatus::New, OrderStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let missing = repo
            .transition(OrderId::new(99), OrderStatus::New, OrderStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(missing, RepositoryError::NotFound(_)));
    }
}
