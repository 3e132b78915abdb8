//! Integration tests for the order pipeline.
//!
//! Tests: OrderService → Order/Stock repositories → Notifier → consumer
//!
//! Verifies:
//! - Stock is conserved across create, pay, cancel and failure paths
//! - Status transitions and their notifications follow call order
//! - Terminal orders reject further payment/cancellation
//! - Published notifications reach the consumer's history exactly once

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use loms_core::{OrderId, Sku, UserId, WarehouseId};
    use loms_events::{
        InMemoryNotifier, InMemorySubscription, Notifier, NotifyError, OrderStatusNotification,
    };
    use loms_observability::OrderMetrics;
    use loms_orders::{OrderItem, OrderStatus};
    use loms_stock::Stock;

    use crate::notifications::{
        HistoryQuery, InMemoryMessageRepository, InMemoryStream, NotificationService,
        NotificationWorker, TracingChatSink, WorkerConfig,
    };
    use crate::repository::{InMemoryOrderRepository, InMemoryStockRepository, StockRepository};
    use crate::service::{OrderService, ServiceError};

    type TestService<N> =
        OrderService<Arc<InMemoryOrderRepository>, Arc<InMemoryStockRepository>, N>;

    const SKU: Sku = Sku::new(42);
    const WH1: WarehouseId = WarehouseId::new(1);
    const WH2: WarehouseId = WarehouseId::new(2);

    struct Harness {
        service: TestService<Arc<InMemoryNotifier>>,
        stock: Arc<InMemoryStockRepository>,
        notifier: Arc<InMemoryNotifier>,
    }

    impl Harness {
        async fn new() -> Self {
            let stock = Arc::new(InMemoryStockRepository::new());
            stock.put_stock(SKU, WH1, 200).await.unwrap();
            stock.put_stock(SKU, WH2, 50).await.unwrap();

            let notifier = Arc::new(InMemoryNotifier::new());
            let service = OrderService::new(
                Arc::new(InMemoryOrderRepository::new()),
                stock.clone(),
                notifier.clone(),
                OrderMetrics::new(),
            );
            Self {
                service,
                stock,
                notifier,
            }
        }

        fn subscribe(&self) -> InMemorySubscription {
            self.notifier.subscribe()
        }

        async fn stocks(&self, sku: Sku) -> Vec<Stock> {
            self.service.stocks(sku).await.unwrap()
        }

        async fn status(&self, id: OrderId) -> OrderStatus {
            self.service.list_order(id).await.unwrap().status()
        }
    }

    fn statuses(sub: &mut InMemorySubscription) -> Vec<OrderStatus> {
        sub.drain().into_iter().map(|n| n.status).collect()
    }

    fn initial_stock() -> Vec<Stock> {
        vec![Stock::new(WH1, 200), Stock::new(WH2, 50)]
    }

    /// Notifier whose transport is always down.
    struct DownNotifier;

    #[async_trait]
    impl Notifier for DownNotifier {
        async fn send(&self, _: OrderStatusNotification) -> Result<(), NotifyError> {
            Err(NotifyError::Transport("broker unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn shortfall_fails_the_order_and_leaves_stock_untouched() {
        let h = Harness::new().await;
        let mut sub = h.subscribe();

        let err = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 260)])
            .await
            .unwrap_err();

        let order_id = match err {
            ServiceError::InsufficientStock {
                order_id,
                sku,
                requested,
                missing,
            } => {
                assert_eq!(sku, SKU);
                assert_eq!(requested, 260);
                assert_eq!(missing, 10);
                order_id
            }
            other => panic!("unexpected error: {other:?}"),
        };

        assert_eq!(h.status(order_id).await, OrderStatus::Failed);
        assert_eq!(h.stocks(SKU).await, initial_stock());
        assert!(h.stock.reservations(order_id).await.unwrap().is_empty());

        let sent = sub.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].status, OrderStatus::New);
        assert_eq!(sent[1].status, OrderStatus::Failed);
        assert_eq!(sent[1].message, "no free item: sku 42 for your order");
    }

    #[tokio::test]
    async fn both_warehouses_together_cover_what_one_cannot() {
        let h = Harness::new().await;

        let id = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 230)])
            .await
            .unwrap();

        assert_eq!(h.status(id).await, OrderStatus::AwaitingPayment);
        let reserved: Vec<(WarehouseId, u64)> = h
            .stock
            .reservations(id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.warehouse_id, r.count))
            .collect();
        assert_eq!(reserved, vec![(WH1, 200), (WH2, 30)]);
        assert_eq!(
            h.stocks(SKU).await,
            vec![Stock::new(WH1, 0), Stock::new(WH2, 20)]
        );
    }

    #[tokio::test]
    async fn order_is_split_across_warehouses() {
        let h = Harness::new().await;
        let mut sub = h.subscribe();

        let id = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 210)])
            .await
            .unwrap();

        assert_eq!(h.status(id).await, OrderStatus::AwaitingPayment);
        assert_eq!(
            h.stocks(SKU).await,
            vec![Stock::new(WH1, 0), Stock::new(WH2, 40)]
        );

        let reserved: Vec<(WarehouseId, u64)> = h
            .stock
            .reservations(id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.warehouse_id, r.count))
            .collect();
        assert_eq!(reserved, vec![(WH1, 200), (WH2, 10)]);

        assert_eq!(
            statuses(&mut sub),
            vec![OrderStatus::New, OrderStatus::AwaitingPayment]
        );
    }

    #[tokio::test]
    async fn payment_writes_off_reservations_without_restoring_stock() {
        let h = Harness::new().await;
        let id = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 210)])
            .await
            .unwrap();
        let mut sub = h.subscribe();

        h.service.order_payed(id).await.unwrap();

        assert_eq!(h.status(id).await, OrderStatus::Payed);
        assert!(h.stock.reservations(id).await.unwrap().is_empty());
        assert_eq!(
            h.stocks(SKU).await,
            vec![Stock::new(WH1, 0), Stock::new(WH2, 40)]
        );
        assert_eq!(statuses(&mut sub), vec![OrderStatus::Payed]);
        assert_eq!(h.service.metrics().snapshot().orders_payed, 1);
    }

    #[tokio::test]
    async fn cancel_returns_stock_to_the_original_warehouses() {
        let h = Harness::new().await;
        let id = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 210)])
            .await
            .unwrap();
        let mut sub = h.subscribe();

        h.service.cancel_order(id).await.unwrap();

        assert_eq!(h.status(id).await, OrderStatus::Cancelled);
        assert_eq!(h.stocks(SKU).await, initial_stock());
        assert!(h.stock.reservations(id).await.unwrap().is_empty());
        assert_eq!(statuses(&mut sub), vec![OrderStatus::Cancelled]);
    }

    #[tokio::test]
    async fn cancelling_twice_matches_cancelling_once() {
        let h = Harness::new().await;
        let id = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 120)])
            .await
            .unwrap();
        let mut sub = h.subscribe();

        h.service.cancel_order(id).await.unwrap();
        let after_first = h.stocks(SKU).await;
        h.service.cancel_order(id).await.unwrap();

        assert_eq!(h.stocks(SKU).await, after_first);
        assert_eq!(after_first, initial_stock());
        // Only the first call announces the cancellation.
        assert_eq!(statuses(&mut sub), vec![OrderStatus::Cancelled]);
        assert_eq!(h.service.metrics().snapshot().orders_cancelled, 1);
    }

    #[tokio::test]
    async fn later_shortfall_releases_earlier_items() {
        let h = Harness::new().await;
        let other = Sku::new(7);
        h.stock.put_stock(other, WH1, 5).await.unwrap();

        let err = h
            .service
            .create_order(
                UserId::new(1),
                vec![OrderItem::new(SKU, 100), OrderItem::new(other, 6)],
            )
            .await
            .unwrap_err();
        let id = err.order_id().unwrap();

        assert_eq!(err.code(), "insufficient_stock");
        assert_eq!(h.status(id).await, OrderStatus::Failed);
        assert_eq!(h.stocks(SKU).await, initial_stock());
        assert_eq!(h.stocks(other).await, vec![Stock::new(WH1, 5)]);
        assert!(h.stock.reservations(id).await.unwrap().is_empty());

        let metrics = h.service.metrics().snapshot();
        assert_eq!(metrics.orders_created, 1);
        assert_eq!(metrics.orders_failed, 1);
        assert_eq!(metrics.orders_awaiting_payment, 0);
    }

    #[tokio::test]
    async fn terminal_orders_reject_pay_and_cancel() {
        let h = Harness::new().await;

        let payed = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 10)])
            .await
            .unwrap();
        h.service.order_payed(payed).await.unwrap();

        let cancelled = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 10)])
            .await
            .unwrap();
        h.service.cancel_order(cancelled).await.unwrap();

        let failed = h
            .service
            .create_order(UserId::new(1), vec![OrderItem::new(SKU, 1_000)])
            .await
            .unwrap_err()
            .order_id()
            .unwrap();

        let before = h.stocks(SKU).await;

        for (id, from) in [(payed, OrderStatus::Payed), (failed, OrderStatus::Failed)] {
            let err = h.service.cancel_order(id).await.unwrap_err();
            assert!(
                matches!(err, ServiceError::InvalidTransition { from: f, to: OrderStatus::Cancelled, .. } if f == from),
                "cancel {from}: {err:?}"
            );
        }
        for (id, from) in [(cancelled, OrderStatus::Cancelled), (failed, OrderStatus::Failed)] {
            let err = h.service.order_payed(id).await.unwrap_err();
            assert_eq!(err.code(), "invalid_transition", "pay {from}");
        }

        assert_eq!(h.stocks(SKU).await, before);
        assert_eq!(h.status(payed).await, OrderStatus::Payed);
        assert_eq!(h.status(cancelled).await, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn notify_failure_does_not_undo_the_order() {
        let stock = Arc::new(InMemoryStockRepository::new());
        stock.put_stock(SKU, WH1, 10).await.unwrap();
        let service: TestService<DownNotifier> = OrderService::new(
            Arc::new(InMemoryOrderRepository::new()),
            stock.clone(),
            DownNotifier,
            OrderMetrics::new(),
        );

        let err = service
            .create_order(UserId::new(3), vec![OrderItem::new(SKU, 4)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "notify_error");

        let id = err.order_id().unwrap();
        assert_eq!(
            service.list_order(id).await.unwrap().status(),
            OrderStatus::AwaitingPayment
        );
        assert_eq!(stock.total_available(SKU), 6);

        let err = service.order_payed(id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Notify { .. }));
        assert_eq!(
            service.list_order(id).await.unwrap().status(),
            OrderStatus::Payed
        );
        assert_eq!(service.metrics().snapshot().notification_failures, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_never_oversell() {
        let h = Arc::new(Harness::new().await);

        let mut handles = Vec::new();
        for user in 0..40 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.service
                    .create_order(UserId::new(user), vec![OrderItem::new(SKU, 10)])
                    .await
            }));
        }

        let mut placed = 0u64;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => placed += 1,
                Err(ServiceError::InsufficientStock { .. }) => {}
                Err(err) => assert_eq!(err.code(), "conflict", "{err:?}"),
            }
        }

        assert!(placed <= 25);
        assert_eq!(h.stock.total_available(SKU), 250 - placed * 10);
    }

    #[tokio::test]
    async fn published_notifications_land_in_history_once() {
        let h = Harness::new().await;
        let messages = Arc::new(InMemoryMessageRepository::new());
        let consumer = Arc::new(NotificationService::new(messages.clone(), TracingChatSink, 16));
        let worker = NotificationWorker::new(
            InMemoryStream::new(h.subscribe()),
            consumer.clone(),
            WorkerConfig::default().with_name("test-worker"),
        );

        let user = UserId::new(77);
        let id = h
            .service
            .create_order(user, vec![OrderItem::new(SKU, 1)])
            .await
            .unwrap();
        h.service.order_payed(id).await.unwrap();
        // A duplicate publish, as a retrying producer would do.
        h.notifier
            .send(OrderStatusNotification::new(
                user,
                id,
                OrderStatus::Payed,
                "the order has been paid",
            ))
            .await
            .unwrap();

        assert_eq!(worker.process_batch().await.unwrap(), 4);
        let stats = worker.stats().await;
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.duplicates, 1);

        let now = Utc::now();
        let history = consumer
            .get_history(HistoryQuery::new(
                user,
                now - Duration::minutes(5),
                now + Duration::minutes(5),
            ))
            .await
            .unwrap();
        let statuses: Vec<OrderStatus> = history.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![
                OrderStatus::New,
                OrderStatus::AwaitingPayment,
                OrderStatus::Payed
            ]
        );
        assert_eq!(messages.len(), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create(u64),
        Pay(usize),
        Cancel(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..120).prop_map(Op::Create),
            (0usize..8).prop_map(Op::Pay),
            (0usize..8).prop_map(Op::Cancel),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        /// available + reserved + sold always equals what was put in.
        #[test]
        fn stock_is_conserved(ops in prop::collection::vec(op(), 1..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let h = Harness::new().await;
                let mut orders: Vec<OrderId> = Vec::new();
                let mut sold = 0u64;

                for op in ops {
                    match op {
                        Op::Create(count) => {
                            let item = OrderItem::new(SKU, count as u32);
                            match h.service.create_order(UserId::new(1), vec![item]).await {
                                Ok(id) => orders.push(id),
                                Err(err) => prop_assert_eq!(err.code(), "insufficient_stock"),
                            }
                        }
                        Op::Pay(i) => {
                            if let Some(&id) = orders.get(i) {
                                let reserved: u64 = h
                                    .stock
                                    .reservations(id)
                                    .await
                                    .unwrap()
                                    .iter()
                                    .map(|r| r.count)
                                    .sum();
                                if h.service.order_payed(id).await.is_ok() {
                                    sold += reserved;
                                }
                            }
                        }
                        Op::Cancel(i) => {
                            if let Some(&id) = orders.get(i) {
                                let _ = h.service.cancel_order(id).await;
                            }
                        }
                    }

                    let mut reserved = 0u64;
                    for id in &orders {
                        reserved += h
                            .stock
                            .reservations(*id)
                            .await
                            .unwrap()
                            .iter()
                            .map(|r| r.count)
                            .sum::<u64>();
                    }
                    prop_assert_eq!(h.stock.total_available(SKU) + reserved + sold, 250);
                }
                Ok(())
            })?;
        }
    }
}
