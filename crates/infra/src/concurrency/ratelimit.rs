//! Requests-per-second plus max-in-flight limiter.
//!
//! A call is admitted once it holds a concurrency permit *and* fewer than
//! `rps` calls were admitted during the last second. The permit is held
//! for the duration of the call and returned on drop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limiter is closed")]
pub struct LimiterClosed;

/// Held while a limited call is in flight.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_concurrency: u32,
    rps: usize,
    /// Admission instants within the last `WINDOW`, oldest first.
    admitted: Mutex<VecDeque<Instant>>,
    closed: AtomicBool,
}

impl RateLimiter {
    /// Zero values are raised to one.
    pub fn new(rps: u32, max_concurrency: u32) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let rps = rps.max(1) as usize;
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency as usize)),
            max_concurrency,
            rps,
            admitted: Mutex::new(VecDeque::with_capacity(rps)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn rps(&self) -> usize {
        self.rps
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency as usize - self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for a concurrency permit, then for a slot in the admission window.
    pub async fn acquire(&self) -> Result<RatePermit, LimiterClosed> {
        if self.is_closed() {
            return Err(LimiterClosed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                while admitted
                    .front()
                    .is_some_and(|at| now.duration_since(*at) >= WINDOW)
                {
                    admitted.pop_front();
                }

                match admitted.front().copied() {
                    Some(oldest) if admitted.len() >= self.rps => {
                        WINDOW - now.duration_since(oldest)
                    }
                    _ => {
                        admitted.push_back(now);
                        return Ok(RatePermit { _permit: permit });
                    }
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Stop admitting new calls and wait until every in-flight call has
    /// released its permit. Callers already queued for a permit are served
    /// before the limiter shuts; later ones get `LimiterClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(all) = self.permits.acquire_many(self.max_concurrency).await {
            self.permits.close();
            drop(all);
        }
        debug!("rate limiter closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Largest number of instants falling in any half-open window
    /// `[t, t + WINDOW)`.
    fn busiest_window(mut instants: Vec<Instant>) -> usize {
        instants.sort();
        let mut best = 0;
        let mut start = 0;
        for end in 0..instants.len() {
            while instants[end].duration_since(instants[start]) >= WINDOW {
                start += 1;
            }
            best = best.max(end - start + 1);
        }
        best
    }

    async fn run_calls(
        limiter: Arc<RateLimiter>,
        durations: Vec<Duration>,
    ) -> (Vec<Instant>, Vec<Instant>) {
        let starts = Arc::new(StdMutex::new(Vec::new()));
        let ends = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for work in durations {
            let limiter = limiter.clone();
            let starts = starts.clone();
            let ends = ends.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                starts.lock().unwrap().push(Instant::now());
                tokio::time::sleep(work).await;
                ends.lock().unwrap().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let starts = starts.lock().unwrap().clone();
        let ends = ends.lock().unwrap().clone();
        (starts, ends)
    }

    #[tokio::test(start_paused = true)]
    async fn completions_stay_within_rps() {
        let limiter = Arc::new(RateLimiter::new(10, 5));
        let (starts, ends) = run_calls(limiter.clone(), vec![Duration::from_millis(100); 25]).await;

        assert_eq!(ends.len(), 25);
        assert!(busiest_window(starts) <= 10);
        assert!(busiest_window(ends) <= 10);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_long_and_short_calls_respect_both_limits() {
        let limiter = Arc::new(RateLimiter::new(10, 5));
        let peak = Arc::new(StdMutex::new(0usize));

        let mut durations = vec![Duration::from_secs(2); 10];
        durations.extend(vec![Duration::from_millis(150); 15]);

        let sampler = {
            let limiter = limiter.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let now = limiter.in_flight();
                    {
                        let mut peak = peak.lock().unwrap();
                        *peak = (*peak).max(now);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
        };

        let (starts, _) = run_calls(limiter.clone(), durations).await;
        sampler.abort();

        assert_eq!(starts.len(), 25);
        assert!(busiest_window(starts) <= 10);
        assert!(*peak.lock().unwrap() <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_in_flight_and_rejects_new_calls() {
        let limiter = Arc::new(RateLimiter::new(10, 2));
        let permit = limiter.acquire().await.unwrap();

        let closer = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.close().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!closer.is_finished());
        assert!(limiter.is_closed());
        assert_eq!(limiter.acquire().await.unwrap_err(), LimiterClosed);

        drop(permit);
        closer.await.unwrap();
        assert_eq!(limiter.acquire().await.unwrap_err(), LimiterClosed);
    }

    #[test]
    fn zero_limits_are_raised_to_one() {
        let limiter = RateLimiter::new(0, 0);
        assert_eq!(limiter.rps(), 1);
        assert_eq!(limiter.max_concurrency(), 1);
    }
}
