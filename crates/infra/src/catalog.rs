//! Product catalog client boundary and rate-limited bulk lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use loms_core::Sku;

use crate::concurrency::{LimiterClosed, RateLimiter, TaskError, WorkerPool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub name: String,
    pub price: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub sku: Sku,
    pub name: String,
    pub price: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("product {0} not found")]
    NotFound(Sku),

    #[error("catalog transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Limiter(#[from] LimiterClosed),

    #[error("lookup cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_product(&self, sku: Sku) -> Result<ProductInfo, CatalogError>;
}

#[async_trait]
impl<C> ProductCatalog for Arc<C>
where
    C: ProductCatalog + ?Sized,
{
    async fn get_product(&self, sku: Sku) -> Result<ProductInfo, CatalogError> {
        (**self).get_product(sku).await
    }
}

/// Fixed product table, optionally answering after a delay.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    products: HashMap<Sku, ProductInfo>,
    latency: Option<Duration>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, sku: Sku, name: impl Into<String>, price: u32) -> Self {
        self.products.insert(
            sku,
            ProductInfo {
                name: name.into(),
                price,
            },
        );
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl ProductCatalog for InMemoryCatalog {
    async fn get_product(&self, sku: Sku) -> Result<ProductInfo, CatalogError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.products
            .get(&sku)
            .cloned()
            .ok_or(CatalogError::NotFound(sku))
    }
}

/// Looks up many skus at once through a worker pool, each call gated by a
/// shared rate limiter.
pub struct BulkLookup<C> {
    catalog: Arc<C>,
    limiter: Arc<RateLimiter>,
    workers: usize,
}

impl<C> BulkLookup<C>
where
    C: ProductCatalog + 'static,
{
    /// One worker per allowed in-flight call.
    pub fn new(catalog: Arc<C>, limiter: Arc<RateLimiter>) -> Self {
        let workers = limiter.max_concurrency() as usize;
        Self {
            catalog,
            limiter,
            workers,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Products in input order. The first failure cancels the remaining
    /// calls and is returned.
    #[instrument(skip(self, skus), fields(count = skus.len()), err)]
    pub async fn lookup(&self, skus: &[Sku]) -> Result<Vec<Product>, CatalogError> {
        if skus.is_empty() {
            return Ok(Vec::new());
        }

        let catalog = self.catalog.clone();
        let limiter = self.limiter.clone();
        let pool = WorkerPool::new(self.workers, skus.len(), move |sku: Sku| {
            let catalog = catalog.clone();
            let limiter = limiter.clone();
            async move {
                let _permit = limiter.acquire().await?;
                let info = catalog.get_product(sku).await?;
                Ok::<_, CatalogError>(Product {
                    sku,
                    name: info.name,
                    price: info.price,
                })
            }
        });

        let mut promises = Vec::with_capacity(skus.len());
        for &sku in skus {
            promises.push(pool.submit(sku).await);
        }

        let mut products = Vec::with_capacity(skus.len());
        let mut failure = None;
        for promise in promises {
            match promise.await {
                Ok(product) => products.push(product),
                Err(err) => {
                    pool.cancel();
                    failure = Some(match err {
                        TaskError::Failed(e) => e,
                        TaskError::Cancelled => CatalogError::Cancelled,
                    });
                    break;
                }
            }
        }
        pool.shutdown().await;

        match failure {
            Some(err) => {
                warn!(error = %err, "bulk lookup failed");
                Err(err)
            }
            None => {
                info!(products = products.len(), "bulk lookup finished");
                Ok(products)
            }
        }
    }

    /// Wait for in-flight calls and refuse further lookups.
    pub async fn close(&self) {
        self.limiter.close().await;
    }
}
