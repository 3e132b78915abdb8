//! Infrastructure layer: repositories, order service, notification
//! transport and consumer, outbound call limiting, configuration.

pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod notifications;
pub mod notifier;
pub mod repository;
pub mod service;

mod integration_tests;

pub use config::{Config, ConfigError};
pub use service::{OrderService, ServiceError};
