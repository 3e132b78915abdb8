//! Strongly-typed identifiers used across the domain.
//!
//! All identifiers are integer newtypes: orders and users come from the
//! relational store of record, SKUs and warehouses are opaque numbers owned by
//! the catalog and the logistics side.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of an order (assigned by the order store).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(i64);

/// Identifier of the user who placed an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

/// Stock-keeping unit: opaque positive product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(u32);

/// Identifier of a stock location.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarehouseId(i64);

macro_rules! impl_int_newtype {
    ($t:ty, $raw:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: $raw) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $raw {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$raw> for $t {
            fn from(value: $raw) -> Self {
                Self(value)
            }
        }

        impl From<$t> for $raw {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = <$raw>::from_str(s.trim())
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(raw))
            }
        }
    };
}

impl_int_newtype!(OrderId, i64, "OrderId");
impl_int_newtype!(UserId, i64, "UserId");
impl_int_newtype!(Sku, u32, "Sku");
impl_int_newtype!(WarehouseId, i64, "WarehouseId");

impl Sku {
    /// Build a SKU, rejecting zero (SKUs are positive).
    pub fn try_new(value: u32) -> Result<Self, DomainError> {
        if value == 0 {
            return Err(DomainError::invalid_id("Sku: must be positive"));
        }
        Ok(Self(value))
    }
}
