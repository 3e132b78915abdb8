//! LOMS process: order service wiring plus the notification consumer.
//!
//! The RPC transport is not part of this binary; the order service is built
//! against the same pool and stream the consumer uses so both sides share
//! one configuration.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loms_infra::Config;
use loms_infra::notifications::{
    NotificationService, NotificationWorker, PostgresMessageRepository, TracingChatSink,
    WorkerConfig,
};
use loms_infra::notifier::{RedisStreamsConsumer, RedisStreamsNotifier};
use loms_infra::repository::postgres::{
    PostgresOrderRepository, PostgresStockRepository, apply_schema,
};
use loms_infra::service::OrderService;
use loms_observability::OrderMetrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("failed to read .env");
        }
    }
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("pretty") => loms_observability::init_pretty(),
        _ => loms_observability::init(),
    }

    let config = Config::from_env().context("invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    apply_schema(&pool).await.context("failed to apply schema")?;

    let notifier = RedisStreamsNotifier::connect(&config.redis_url, &config.notifications_stream)
        .await
        .context("failed to connect notifier to redis")?;

    let metrics = OrderMetrics::new();
    let orders = OrderService::new(
        PostgresOrderRepository::new(pool.clone()),
        PostgresStockRepository::new(pool.clone()),
        notifier,
        metrics.clone(),
    );

    let consumer_name = format!("{}-{}", config.notifications_group, uuid::Uuid::now_v7());
    let stream = RedisStreamsConsumer::connect(
        &config.redis_url,
        &config.notifications_stream,
        &config.notifications_group,
        &consumer_name,
        config.notifications_batch,
        config.notifications_block_ms,
    )
    .await
    .context("failed to join notification consumer group")?;

    let notifications = Arc::new(NotificationService::new(
        PostgresMessageRepository::new(pool.clone()),
        TracingChatSink,
        config.history_cache_capacity,
    ));
    let worker = NotificationWorker::new(
        stream,
        notifications,
        WorkerConfig::default().with_name(consumer_name),
    );

    let cancel = CancellationToken::new();
    let consumer = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    info!(
        stream = %config.notifications_stream,
        group = %config.notifications_group,
        "loms started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    match consumer.await {
        Ok(stats) => info!(?stats, "notification consumer stopped"),
        Err(e) => warn!(error = %e, "notification consumer task failed"),
    }

    info!(metrics = ?orders.metrics().snapshot(), "order metrics at shutdown");
    pool.close().await;
    Ok(())
}
