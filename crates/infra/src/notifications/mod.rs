//! Notification consumer: persists order status messages, forwards them to
//! the user's chat, and serves the per-user history.

pub mod cache;
pub mod model;
pub mod postgres;
pub mod repository;
pub mod service;
pub mod worker;

pub use cache::LruCache;
pub use model::{HistoryQuery, StoredMessage};
pub use postgres::PostgresMessageRepository;
pub use repository::{InMemoryMessageRepository, MessageRepository};
pub use service::{ChatError, ChatSink, NotificationError, NotificationService, TracingChatSink};
pub use worker::{
    Delivery, InMemoryStream, NotificationStream, NotificationWorker, StreamError, WorkerConfig,
    WorkerStats,
};
