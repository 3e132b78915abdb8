//! Bounded concurrency for outbound calls: a rate limiter and a fixed-size
//! worker pool.

pub mod ratelimit;
pub mod workerpool;

pub use ratelimit::{LimiterClosed, RateLimiter, RatePermit};
pub use workerpool::{Promise, TaskError, WorkerPool};
