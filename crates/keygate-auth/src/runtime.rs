//! Execution resources: the crypto worker pool, the penalty scheduler and
//! detached store writes.
//!
//! Signing, key generation and compression are CPU-bound and run on the
//! blocking pool behind a semaphore, so a burst of token issuance cannot
//! occupy every blocking thread. Penalty delays run on their own
//! single-worker runtime and never hold a request worker while they wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Semaphore, oneshot};

use crate::{AuthError, AuthResult};

/// Bounded pool for CPU-bound crypto work.
#[derive(Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    /// Creates a pool allowing `workers` concurrent jobs.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Runs `job` on a blocking thread once a permit is free.
    ///
    /// The job runs to completion even if the calling future is dropped.
    ///
    /// # Errors
    ///
    /// Returns the job's own error, or `AuthError::Internal` if the worker
    /// panicked.
    pub async fn run<F, T>(&self, job: F) -> AuthResult<T>
    where
        F: FnOnce() -> AuthResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AuthError::internal("crypto pool closed"))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await?
    }

    /// Number of currently free permits.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Applies the deliberate response delay on a dedicated scheduler.
pub struct PenaltyScheduler {
    delay: Duration,
    runtime: Option<Runtime>,
}

impl PenaltyScheduler {
    /// Creates a scheduler with its own timer thread.
    ///
    /// A zero delay creates no thread and `apply` returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the runtime cannot be built.
    pub fn new(delay: Duration) -> AuthResult<Self> {
        let runtime = if delay.is_zero() {
            None
        } else {
            Some(
                Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("keygate-penalty")
                    .enable_time()
                    .build()
                    .map_err(|e| AuthError::internal(format!("penalty scheduler: {e}")))?,
            )
        };
        Ok(Self { delay, runtime })
    }

    /// The configured delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits for the penalty delay.
    pub async fn apply(&self) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        let delay = self.delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
        // A dropped sender means the scheduler is shutting down.
        let _ = rx.await;
    }
}

impl Drop for PenaltyScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Runs a store write as its own task so it completes even if the caller
/// goes away.
///
/// # Errors
///
/// Returns the write's error, or `AuthError::Internal` if the task panicked.
pub async fn run_detached<F, T>(write: F) -> AuthResult<T>
where
    F: Future<Output = AuthResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(write).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_crypto_pool_runs_job() {
        let pool = CryptoPool::new(2);
        let out = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_crypto_pool_propagates_job_error() {
        let pool = CryptoPool::new(1);
        let err = pool
            .run(|| -> AuthResult<()> { Err(AuthError::crypto("bad key")) })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Crypto { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crypto_pool_bounds_concurrency() {
        let pool = CryptoPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_penalty_waits_for_delay() {
        let penalty = PenaltyScheduler::new(Duration::from_millis(50)).unwrap();
        let started = Instant::now();
        penalty.apply().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_zero_penalty_returns_immediately() {
        let penalty = PenaltyScheduler::new(Duration::ZERO).unwrap();
        let started = Instant::now();
        penalty.apply().await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_run_detached_completes_after_caller_drops() {
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        let caller = tokio::spawn(run_detached(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
