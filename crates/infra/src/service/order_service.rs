//! Order lifecycle orchestration.
//!
//! `OrderService` drives an order through
//! `new → awaiting_payment → payed` (or `failed` / `cancelled`), moving stock
//! between the available ledger and per-order reservations as it goes.
//!
//! Each repository call is its own transaction. Status changes are
//! compare-and-set on the order row, so two racing calls on the same order
//! cannot both win. Notifications are sent after the change they describe
//! has committed; a failed send is reported but never rolls anything back.

use std::collections::BTreeSet;

use tracing::{Span, debug, info, instrument, warn};

use loms_core::{OrderId, Sku, UserId};
use loms_events::{
    Notifier, NotifyError, OrderStatusNotification,
    notification::{MSG_AWAITING_PAYMENT, MSG_CANCELLED, MSG_CREATED, MSG_FAILED, MSG_PAYED},
};
use loms_observability::OrderMetrics;
use loms_orders::{NewOrder, Order, OrderItem, OrderStatus};
use loms_stock::{Shortfall, Stock, allocate};

use super::error::{ServiceError, step};
use crate::repository::{OrderRepository, RepositoryError, StockRepository};

pub struct OrderService<O, S, N> {
    orders: O,
    stock: S,
    notifier: N,
    metrics: OrderMetrics,
}

impl<O, S, N> OrderService<O, S, N>
where
    O: OrderRepository,
    S: StockRepository,
    N: Notifier,
{
    pub fn new(orders: O, stock: S, notifier: N, metrics: OrderMetrics) -> Self {
        Self {
            orders,
            stock,
            notifier,
            metrics,
        }
    }

    pub fn metrics(&self) -> &OrderMetrics {
        &self.metrics
    }

    /// Place an order and reserve stock for every item.
    ///
    /// On a shortfall the order is kept as `failed`, everything reserved for
    /// earlier items is released, and `InsufficientStock` is returned with
    /// the order id. A repository failure after the order row exists is
    /// unwound the same way and its error is returned.
    #[instrument(
        skip(self, items),
        fields(user_id = %user_id, item_count = items.len(), order_id = tracing::field::Empty),
        err
    )]
    pub async fn create_order(
        &self,
        user_id: UserId,
        items: Vec<OrderItem>,
    ) -> Result<OrderId, ServiceError> {
        let request = NewOrder::new(user_id, items);
        request
            .validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let order_id = self
            .orders
            .create_order(user_id, &request.items)
            .await
            .map_err(step("create order"))?;
        Span::current().record("order_id", order_id.get());
        self.metrics.order_created();

        let mut notify_failure = self
            .publish(OrderStatusNotification::new(
                user_id,
                order_id,
                OrderStatus::New,
                MSG_CREATED,
            ))
            .await
            .err();

        let mut reserved: BTreeSet<Sku> = BTreeSet::new();
        if let Err(failure) = self
            .reserve_items(order_id, &request.items, &mut reserved)
            .await
        {
            return Err(self.fail_order(user_id, order_id, failure, &reserved).await);
        }

        if let Err(e) = self
            .orders
            .transition(order_id, OrderStatus::New, OrderStatus::AwaitingPayment)
            .await
        {
            let failure = ReserveFailure::Repository(step("set awaiting payment status")(e));
            return Err(self.fail_order(user_id, order_id, failure, &reserved).await);
        }
        self.metrics.order_awaiting_payment();
        info!(order_id = %order_id, "order is awaiting payment");

        let last = self
            .publish(OrderStatusNotification::new(
                user_id,
                order_id,
                OrderStatus::AwaitingPayment,
                MSG_AWAITING_PAYMENT,
            ))
            .await
            .err();
        notify_failure = notify_failure.or(last);

        match notify_failure {
            Some(source) => Err(ServiceError::Notify { order_id, source }),
            None => Ok(order_id),
        }
    }

    /// Reserve every item in order, recording each sku once its reservation
    /// has committed.
    async fn reserve_items(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
        reserved: &mut BTreeSet<Sku>,
    ) -> Result<(), ReserveFailure> {
        for item in items {
            let stocks = self
                .stock
                .available_stocks(item.sku)
                .await
                .map_err(|e| ReserveFailure::Repository(step("get available stocks")(e)))?;

            let plan = allocate(u64::from(item.count), &stocks).map_err(|shortfall| {
                ReserveFailure::Shortfall {
                    sku: item.sku,
                    shortfall,
                }
            })?;

            debug!(sku = %item.sku, takes = plan.takes().len(), "allocated");
            self.stock
                .reserve(order_id, item.sku, &plan)
                .await
                .map_err(|e| ReserveFailure::Repository(step("reserve stock")(e)))?;
            reserved.insert(item.sku);
        }
        Ok(())
    }

    /// `new → failed`, release what earlier items reserved and tell the
    /// user. Returns the error the caller should see.
    async fn fail_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
        failure: ReserveFailure,
        reserved: &BTreeSet<Sku>,
    ) -> ServiceError {
        let (error, notification) = match failure {
            ReserveFailure::Shortfall { sku, shortfall } => {
                warn!(
                    order_id = %order_id,
                    sku = %sku,
                    requested = shortfall.requested,
                    missing = shortfall.missing,
                    "insufficient stock, failing order"
                );
                (
                    ServiceError::InsufficientStock {
                        order_id,
                        sku,
                        requested: shortfall.requested,
                        missing: shortfall.missing,
                    },
                    OrderStatusNotification::failed(user_id, order_id, format!("sku {sku}")),
                )
            }
            ReserveFailure::Repository(error) => {
                warn!(order_id = %order_id, error = %error, "reservation failed, failing order");
                (
                    error,
                    OrderStatusNotification::new(
                        user_id,
                        order_id,
                        OrderStatus::Failed,
                        MSG_FAILED,
                    ),
                )
            }
        };

        if let Err(e) = self.release_and_fail(order_id, reserved).await {
            warn!(order_id = %order_id, error = %e, "could not fail order");
            return match error {
                ServiceError::InsufficientStock { .. } => e,
                other => other,
            };
        }

        // Delivery failure here is logged by `publish`; the reservation
        // failure is the error the caller needs to see.
        let _ = self.publish(notification).await;
        error
    }

    /// Reservations are only released once the order is `failed`, so an
    /// order whose status could not be changed keeps its stock.
    async fn release_and_fail(
        &self,
        order_id: OrderId,
        reserved: &BTreeSet<Sku>,
    ) -> Result<(), ServiceError> {
        self.orders
            .transition(order_id, OrderStatus::New, OrderStatus::Failed)
            .await
            .map_err(step("set failed status"))?;

        for sku in reserved {
            self.stock
                .unreserve(order_id, *sku)
                .await
                .map_err(step("unreserve stock"))?;
        }
        self.metrics.order_failed();
        Ok(())
    }

    /// Cancel an order awaiting payment and return its stock.
    ///
    /// Cancelling an already cancelled order succeeds without notifying
    /// again. Any leftover reservations are still released, so a cancel
    /// interrupted after the status change can be completed by retrying.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<(), ServiceError> {
        let order = self.load(order_id, "get order").await?;

        let newly_cancelled = match order.status() {
            OrderStatus::AwaitingPayment => {
                self.orders
                    .transition(order_id, OrderStatus::AwaitingPayment, OrderStatus::Cancelled)
                    .await
                    .map_err(step("set cancelled status"))?;
                true
            }
            OrderStatus::Cancelled => false,
            from => {
                return Err(ServiceError::InvalidTransition {
                    order_id,
                    from,
                    to: OrderStatus::Cancelled,
                });
            }
        };

        let mut released: u64 = 0;
        for sku in distinct_skus(&order) {
            let rows = self
                .stock
                .unreserve(order_id, sku)
                .await
                .map_err(step("unreserve stock"))?;
            released += rows.iter().map(|r| r.count).sum::<u64>();
        }

        if !newly_cancelled {
            debug!(order_id = %order_id, released, "order already cancelled");
            return Ok(());
        }

        self.metrics.order_cancelled();
        info!(order_id = %order_id, released, "order cancelled");

        self.publish(OrderStatusNotification::new(
            order.user_id(),
            order_id,
            OrderStatus::Cancelled,
            MSG_CANCELLED,
        ))
        .await
        .map_err(|source| ServiceError::Notify { order_id, source })
    }

    /// Mark an order as paid and write off its reservations.
    ///
    /// Paying an already paid order succeeds without notifying again and
    /// only writes off reservations left over from an interrupted payment.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn order_payed(&self, order_id: OrderId) -> Result<(), ServiceError> {
        let order = self.load(order_id, "get order").await?;

        let newly_payed = match order.status() {
            OrderStatus::AwaitingPayment => {
                self.orders
                    .transition(order_id, OrderStatus::AwaitingPayment, OrderStatus::Payed)
                    .await
                    .map_err(step("set payed status"))?;
                true
            }
            OrderStatus::Payed => false,
            from => {
                return Err(ServiceError::InvalidTransition {
                    order_id,
                    from,
                    to: OrderStatus::Payed,
                });
            }
        };

        let written_off = self
            .stock
            .write_off(order_id)
            .await
            .map_err(step("write off reservations"))?;
        let units = written_off.iter().map(|r| r.count).sum::<u64>();

        if !newly_payed {
            debug!(order_id = %order_id, units, "order already payed");
            return Ok(());
        }

        self.metrics.order_payed();
        info!(
            order_id = %order_id,
            reservations = written_off.len(),
            units,
            "order payed"
        );

        self.publish(OrderStatusNotification::new(
            order.user_id(),
            order_id,
            OrderStatus::Payed,
            MSG_PAYED,
        ))
        .await
        .map_err(|source| ServiceError::Notify { order_id, source })
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn list_order(&self, order_id: OrderId) -> Result<Order, ServiceError> {
        self.load(order_id, "list order").await
    }

    #[instrument(skip(self), fields(sku = %sku), err)]
    pub async fn stocks(&self, sku: Sku) -> Result<Vec<Stock>, ServiceError> {
        self.stock
            .available_stocks(sku)
            .await
            .map_err(step("get stocks"))
    }

    async fn load(&self, order_id: OrderId, name: &'static str) -> Result<Order, ServiceError> {
        match self.orders.get_order(order_id).await {
            Ok(order) => Ok(order),
            Err(RepositoryError::NotFound(_)) => Err(ServiceError::NotFound(order_id)),
            Err(e) => Err(step(name)(e)),
        }
    }

    async fn publish(&self, notification: OrderStatusNotification) -> Result<(), NotifyError> {
        let order_id = notification.order_id;
        let status = notification.status;

        self.notifier.send(notification).await.inspect_err(|err| {
            self.metrics.notification_failed();
            warn!(order_id = %order_id, status = %status, error = %err, "failed to send notification");
        })
    }
}

/// Why reserving an order's items stopped.
enum ReserveFailure {
    Shortfall { sku: Sku, shortfall: Shortfall },
    Repository(ServiceError),
}

/// Skus of the order, each once, in a stable order.
fn distinct_skus(order: &Order) -> BTreeSet<Sku> {
    order.items().iter().map(|item| item.sku).collect()
}
