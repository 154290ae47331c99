//! A single-consumer, multi-producer FIFO task runner.
//!
//! Many producers can [`SequentialRunner::enqueue`] work concurrently; the
//! runner guarantees the Nth enqueued thunk finishes (success, failure, or
//! cancellation) before the N+1th begins. Used wherever two callers might
//! otherwise write to the same transport at once — the Cable WebSocket sink,
//! the Marlin serial writer.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Error returned by a queued operation that never produced a result.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RunnerError {
    /// The caller's cancellation token fired before the thunk completed.
    #[error("operation canceled")]
    Canceled,
    /// The runner's consumer loop has shut down (all senders dropped).
    #[error("sequential runner stopped")]
    Stopped,
}

/// Handle to a background FIFO consumer loop.
///
/// Cloning shares the same underlying queue; dropping all clones stops the
/// consumer loop once it drains any jobs already enqueued.
#[derive(Clone)]
pub struct SequentialRunner {
    tx: mpsc::UnboundedSender<Job>,
}

impl SequentialRunner {
    /// Spawn the consumer loop and return a handle to it.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job().await;
            }
        });
        SequentialRunner { tx }
    }

    /// Enqueue `work`, running it only after every previously enqueued thunk
    /// has completed. `work` is not invoked at all if `token` is already
    /// canceled by the time the consumer loop reaches it.
    pub async fn enqueue<F, Fut, T>(&self, token: CancellationToken, work: F) -> Result<T, RunnerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel::<T>();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                if token.is_cancelled() {
                    return;
                }
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = work() => result,
                };
                let _ = result_tx.send(result);
            })
        });

        self.tx.send(job).map_err(|_| RunnerError::Stopped)?;

        result_rx.await.map_err(|_| RunnerError::Canceled)
    }

    /// Non-blocking, thread-safe enqueue of fire-and-forget work; the caller
    /// does not await a result.
    pub fn enqueue_detached<F, Fut>(&self, work: F) -> Result<(), RunnerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::new(move || Box::pin(work()));
        self.tx.send(job).map_err(|_| RunnerError::Stopped)
    }
}

impl Default for SequentialRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_ordering_under_concurrent_producers() {
        let runner = SequentialRunner::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..20u32 {
            let runner = runner.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                runner
                    .enqueue(CancellationToken::new(), move || {
                        let order = Arc::clone(&order);
                        async move {
                            // Stagger completion so a non-FIFO implementation would reorder.
                            tokio::time::sleep(Duration::from_micros((20 - i) as u64)).await;
                            order.lock().unwrap().push(i);
                        }
                    })
                    .await
                    .unwrap();
            }));
        }

        // Enqueue calls race across tasks, but within a single task enqueue()
        // only returns once the thunk has actually run and recorded itself.
        for (i, h) in handles.into_iter().enumerate() {
            h.await.unwrap();
            assert_eq!(*order.lock().unwrap().last().unwrap(), i as u32);
        }
    }

    #[tokio::test]
    async fn failing_thunk_does_not_block_the_next() {
        let runner = SequentialRunner::new();

        let first: Result<Result<(), &'static str>, RunnerError> = runner
            .enqueue(CancellationToken::new(), || async { Err("boom") })
            .await;
        assert_eq!(first, Ok(Err("boom")));

        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = Arc::clone(&counter);
        let second = runner
            .enqueue(CancellationToken::new(), move || async move {
                counter2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_releases_the_caller_without_running_the_body() {
        let runner = SequentialRunner::new();
        let token = CancellationToken::new();
        token.cancel();

        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = Arc::clone(&ran);
        let result = runner
            .enqueue(token, move || async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(result, Err(RunnerError::Canceled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_flight_still_lets_later_jobs_run() {
        let runner = SequentialRunner::new();
        let blocking_token = CancellationToken::new();
        let blocking_token2 = blocking_token.clone();

        let blocked = tokio::spawn({
            let runner = runner.clone();
            async move {
                runner
                    .enqueue(blocking_token2, || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    })
                    .await
            }
        });

        // Give the consumer loop a chance to pick up the blocking job.
        tokio::time::sleep(Duration::from_millis(10)).await;
        blocking_token.cancel();
        let blocked_result = blocked.await.unwrap();
        assert_eq!(blocked_result, Err(RunnerError::Canceled));

        let next = runner
            .enqueue(CancellationToken::new(), || async { 42 })
            .await;
        assert_eq!(next, Ok(42));
    }
}
