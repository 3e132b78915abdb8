//! Order status notifications and the boundary used to publish them.
//!
//! The order service only sees the [`Notifier`] trait. Transports live
//! elsewhere (`loms-infra` ships the Redis Streams one); this crate carries
//! the payload and an in-memory fan-out for tests and local runs.

pub mod in_memory;
pub mod notification;
pub mod notifier;

pub use in_memory::{InMemoryNotifier, InMemorySubscription};
pub use notification::OrderStatusNotification;
pub use notifier::{Notifier, NotifyError};
