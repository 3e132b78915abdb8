//! Notifier transports beyond the in-process one in `loms-events`.

pub mod redis_streams;

pub use redis_streams::{RedisStreamsConsumer, RedisStreamsError, RedisStreamsNotifier};
