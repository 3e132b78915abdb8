//! `loms-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the order and stock
//! modules (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OrderId, Sku, UserId, WarehouseId};
