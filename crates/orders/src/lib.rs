//! Order domain module.
//!
//! Orders are created once with a fixed item list; afterwards only their
//! status moves, and only along the lifecycle encoded in [`OrderStatus`].
//! Pure domain logic: no IO, no storage.

pub mod order;

pub use order::{NewOrder, Order, OrderItem, OrderStatus};
