//! Application services.

pub mod error;
pub mod order_service;

pub use error::ServiceError;
pub use order_service::OrderService;
