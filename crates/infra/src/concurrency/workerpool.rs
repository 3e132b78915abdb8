//! Fixed-size worker pool over a bounded task queue.
//!
//! `submit` hands back a [`Promise`] that resolves with the step's result.
//! Cancelling the pool stops the workers; anything still queued or running
//! resolves as [`TaskError::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError<E> {
    #[error("task cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Failed(E),
}

type Reply<O, E> = oneshot::Sender<Result<O, TaskError<E>>>;

struct Task<I, O, E> {
    input: I,
    reply: Reply<O, E>,
}

/// Result of one submitted task.
pub struct Promise<O, E> {
    rx: oneshot::Receiver<Result<O, TaskError<E>>>,
}

impl<O, E> Promise<O, E> {
    fn resolved(result: Result<O, TaskError<E>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<O, E> Future for Promise<O, E> {
    type Output = Result<O, TaskError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            // Worker gone before answering.
            Err(_) => Err(TaskError::Cancelled),
        })
    }
}

pub struct WorkerPool<I, O, E> {
    queue: mpsc::Sender<Task<I, O, E>>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl<I, O, E> WorkerPool<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Spawn `workers` tasks (at least one) on the current runtime, each
    /// running `step` on queued inputs one at a time.
    pub fn new<F, Fut>(workers: usize, queue_capacity: usize, step: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let step = Arc::new(step);
        let cancel = CancellationToken::new();

        let workers = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    rx.clone(),
                    step.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            queue,
            cancel,
            workers,
        }
    }

    /// Queue one input, waiting while the queue is full.
    pub async fn submit(&self, input: I) -> Promise<O, E> {
        let (reply, rx) = oneshot::channel();
        let task = Task { input, reply };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Promise::resolved(Err(TaskError::Cancelled)),
            sent = self.queue.send(task) => match sent {
                Ok(()) => Promise { rx },
                Err(_) => Promise::resolved(Err(TaskError::Cancelled)),
            },
        }
    }

    /// Stop taking work. Queued and running tasks resolve `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Let the queue drain (unless cancelled) and wait for every worker.
    pub async fn shutdown(self) {
        let Self {
            queue,
            cancel: _,
            workers,
        } = self;
        drop(queue);

        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn run_worker<I, O, E, F, Fut>(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task<I, O, E>>>>,
    step: Arc<F>,
    cancel: CancellationToken,
) where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<O, E>>,
{
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(Task { input, reply }) = next else {
            break;
        };

        tokio::select! {
            biased;
            // Dropping `reply` resolves the promise as cancelled.
            _ = cancel.cancelled() => break,
            result = step(input) => {
                let _ = reply.send(result.map_err(TaskError::Failed));
            }
        }
    }
    debug!(worker, "worker stopped");
}
