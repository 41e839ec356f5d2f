//! Sliding-window consecutive-failure circuit breaker.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::error::{ClientError, Result};

/// Two-state breaker: Closed (ready) while consecutive failures stay
/// below the threshold, Open once they cross it. Open expires back to
/// Closed purely by the window elapsing since the last failure; there is
/// no half-open probe.
///
/// All state is atomics, so marking success/failure never blocks callers.
#[derive(Debug)]
pub struct ConsecCircuitBreaker {
    /// Milliseconds since `epoch` of the last failure.
    last_failure_ms: AtomicU64,
    failures: AtomicU64,
    failure_threshold: u64,
    window: Duration,
    epoch: Instant,
}

impl ConsecCircuitBreaker {
    /// Breaker that opens after `failure_threshold` consecutive failures
    /// within `window`.
    #[must_use]
    pub fn new(failure_threshold: u64, window: Duration) -> Self {
        Self {
            last_failure_ms: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            failure_threshold,
            window,
            epoch: Instant::now(),
        }
    }

    /// Whether a call would currently be admitted.
    #[must_use]
    pub fn ready(&self) -> bool {
        let last_ms = self.last_failure_ms.load(Ordering::Acquire);
        let elapsed = self.now_ms().saturating_sub(last_ms);
        if elapsed > self.window.as_millis() as u64 {
            self.reset();
            return true;
        }
        self.failures.load(Ordering::Acquire) < self.failure_threshold
    }

    /// Run `fut` through the breaker, optionally bounded by `timeout`.
    ///
    /// Rejects immediately with [`ClientError::BreakerOpen`] when not
    /// ready; a timed-out call yields [`ClientError::BreakerTimeout`] and
    /// counts as a failure.
    pub async fn call<T, F>(&self, fut: F, timeout: Option<Duration>) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.ready() {
            return Err(ClientError::BreakerOpen);
        }

        let outcome = match timeout {
            None => fut.await,
            Some(d) => match tokio::time::timeout(d, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::BreakerTimeout),
            },
        };

        match &outcome {
            Ok(_) => self.success(),
            Err(_) => self.fail(),
        }
        outcome
    }

    /// Mark a success: the failure streak resets.
    pub fn success(&self) {
        self.reset();
    }

    /// Mark a failure: bump the streak and stamp the failure time.
    pub fn fail(&self) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        self.last_failure_ms.store(self.now_ms(), Ordering::Release);
    }

    fn reset(&self) {
        self.failures.store(0, Ordering::Release);
        self.last_failure_ms.store(self.now_ms(), Ordering::Release);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_after_threshold_and_recovers() {
        let cb = ConsecCircuitBreaker::new(5, Duration::from_millis(100));

        for _ in 0..5 {
            let out: Result<()> = cb.call(async { Err(ClientError::UnexpectedEof) }, None).await;
            assert!(matches!(out, Err(ClientError::UnexpectedEof)));
        }
        assert!(!cb.ready());
        let out: Result<()> = cb.call(async { Ok(()) }, None).await;
        assert!(matches!(out, Err(ClientError::BreakerOpen)));

        // The window elapses and the breaker closes again on its own.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cb.ready());
        let out: Result<()> = cb.call(async { Ok(()) }, None).await;
        assert!(out.is_ok());
        assert_eq!(cb.failures.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let cb = ConsecCircuitBreaker::new(3, Duration::from_secs(60));
        cb.fail();
        cb.fail();
        cb.success();
        cb.fail();
        assert!(cb.ready());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let cb = ConsecCircuitBreaker::new(1, Duration::from_secs(60));
        let out: Result<()> = cb
            .call(
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                Some(Duration::from_millis(10)),
            )
            .await;
        assert!(matches!(out, Err(ClientError::BreakerTimeout)));
        assert!(!cb.ready());
    }
}
