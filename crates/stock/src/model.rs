use serde::{Deserialize, Serialize};

use loms_core::{OrderId, Sku, WarehouseId};

/// Available (unreserved) count of one SKU in one warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    pub warehouse_id: WarehouseId,
    pub count: u64,
}

impl Stock {
    pub fn new(warehouse_id: WarehouseId, count: u64) -> Self {
        Self {
            warehouse_id,
            count,
        }
    }
}

/// Units of `sku` held for `order_id` in one warehouse.
///
/// Reserved units are not part of the available count; releasing a
/// reservation returns them to the same warehouse it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: OrderId,
    pub sku: Sku,
    pub warehouse_id: WarehouseId,
    pub count: u64,
}
