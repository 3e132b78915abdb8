use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Stock;

/// Per-warehouse take list produced by [`allocate`].
///
/// Entries keep the order of the input stock list and never carry a zero
/// count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    takes: Vec<Stock>,
}

impl AllocationPlan {
    pub fn takes(&self) -> &[Stock] {
        &self.takes
    }

    pub fn into_takes(self) -> Vec<Stock> {
        self.takes
    }

    pub fn total(&self) -> u64 {
        self.takes.iter().map(|s| s.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.takes.is_empty()
    }
}

/// The warehouses together hold less than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient stock: requested {requested}, missing {missing}")]
pub struct Shortfall {
    pub requested: u64,
    pub missing: u64,
}

/// Greedy single-pass allocation over `stocks` in the given order.
///
/// Takes `min(remaining, available)` from each warehouse and stops as soon
/// as the request is covered. Zero-count warehouses are skipped. A zero
/// request yields an empty plan.
pub fn allocate(requested: u64, stocks: &[Stock]) -> Result<AllocationPlan, Shortfall> {
    let mut remaining = requested;
    let mut takes = Vec::new();

    for stock in stocks {
        if remaining == 0 {
            break;
        }
        if stock.count == 0 {
            continue;
        }
        let take = remaining.min(stock.count);
        takes.push(Stock::new(stock.warehouse_id, take));
        remaining -= take;
    }

    if remaining > 0 {
        return Err(Shortfall {
            requested,
            missing: remaining,
        });
    }

    Ok(AllocationPlan { takes })
}
