//! Bounded or unbounded retry with exponential backoff.
//!
//! - [`RetryPolicy::delay_for`] computes the delay before a retry.
//! - [`RetryPolicy::execute`] wraps any fallible async operation.
//! - [`RetryState`] is the same loop, unrolled for call sites whose operation
//!   borrows mutable state and cannot be re-invoked through a closure.

use crate::utils::error::{ErrorKind, IndexerError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first call. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`; the delay is scaled by `1 ± jitter`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

/// One scheduled retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub last_error: Option<ErrorKind>,
    pub next_delay: Duration,
}

fn transient_only(kind: ErrorKind) -> bool {
    kind == ErrorKind::Transient
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retryable: fn(ErrorKind) -> bool,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retryable: transient_only,
        }
    }

    /// Replaces the default "transient only" classification.
    #[must_use]
    pub fn with_predicate(mut self, retryable: fn(ErrorKind) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn is_retryable(&self, err: &IndexerError) -> bool {
        (self.retryable)(err.kind())
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`, then scaled by
    /// a uniform factor in `[1 - jitter, 1 + jitter]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cfg = &self.config;
        if cfg.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = cfg.base_delay.as_millis() as f64 * cfg.multiplier.powi(exponent);
        let capped_ms = base_ms.min(cfg.max_delay.as_millis() as f64);

        let jitter = cfg.jitter.clamp(0.0, 1.0);
        let ms = if jitter > 0.0 {
            capped_ms * rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            capped_ms
        };

        Duration::from_millis(ms.round() as u64)
    }

    pub fn begin(&self) -> RetryState<'_> {
        RetryState {
            policy: self,
            attempt: 0,
            last_error: None,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The final error is returned unchanged.
    ///
    /// Backoff sleeps observe `cancel`; a cancelled wait yields
    /// [`IndexerError::Cancelled`]. The operation itself is never interrupted.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_observed(cancel, op, |_| {}).await
    }

    /// [`execute`](Self::execute), calling `on_retry` after every backoff.
    pub async fn execute_observed<F, Fut, T, O>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(&RetryAttempt),
    {
        let mut state = self.begin();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let attempt = state.backoff(err, cancel).await?;
                    on_retry(&attempt);
                }
            }
        }
    }
}

/// Attempt bookkeeping for a single retried call.
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempt: u32,
    last_error: Option<ErrorKind>,
}

impl RetryState<'_> {
    /// Records a failure and decides whether another attempt is allowed.
    ///
    /// Returns the scheduled attempt, or gives the error back when it is not
    /// retryable or the budget is exhausted.
    pub fn record(&mut self, err: IndexerError) -> Result<RetryAttempt> {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(err.kind());

        if !self.policy.is_retryable(&err) {
            return Err(err);
        }
        if let Some(max) = self.policy.config.max_attempts {
            if self.attempt >= max {
                tracing::warn!(attempts = self.attempt, error = %err, "Retry budget exhausted");
                return Err(err);
            }
        }

        let next_delay = self.policy.delay_for(self.attempt);
        tracing::warn!(
            attempt = self.attempt,
            max = ?self.policy.config.max_attempts,
            delay_ms = next_delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );

        Ok(RetryAttempt {
            attempt: self.attempt,
            last_error: self.last_error,
            next_delay,
        })
    }

    /// Records `err` and sleeps for the backoff delay, or returns the error.
    pub async fn backoff(&mut self, err: IndexerError, cancel: &CancellationToken) -> Result<RetryAttempt> {
        let scheduled = self.record(err)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IndexerError::Cancelled),
            _ = tokio::time::sleep(scheduled.next_delay) => Ok(scheduled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1_000),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_attempt1_equals_base() {
        let policy = RetryPolicy::new(no_jitter(None));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delays_non_decreasing_until_cap() {
        let policy = RetryPolicy::new(no_jitter(None));
        let delays: Vec<Duration> = (1..=10).map(|n| policy.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "backoff should not shrink: {pair:?}");
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let policy = RetryPolicy::new(no_jitter(None));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: 0.25,
            ..no_jitter(None)
        });
        for _ in 0..200 {
            let d = policy.delay_for(2).as_secs_f64();
            assert!((0.15..=0.25).contains(&d), "jittered delay out of range: {d}");
        }
    }

    #[test]
    fn test_zero_base_delay_is_immediate() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay: Duration::ZERO,
            ..no_jitter(None)
        });
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_n_attempts_then_last_error() {
        let policy = RetryPolicy::new(no_jitter(Some(4)));
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = policy
            .execute(&cancel, || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(IndexerError::Transient(format!("attempt {n}")))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(IndexerError::Transient(msg)) => assert_eq!(msg, "attempt 4"),
            other => panic!("expected final transient error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(no_jitter(Some(5)));
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = policy
            .execute(&cancel, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IndexerError::Transient("blip".into()))
                } else {
                    Ok(7u64)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::new(no_jitter(None));
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = policy
            .execute(&cancel, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::Data("constraint".into()))
            })
            .await;

        assert!(matches!(result, Err(IndexerError::Data(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_stops_on_cancel() {
        let policy = RetryPolicy::new(no_jitter(None));
        let cancel = CancellationToken::new();
        let calls = &AtomicU32::new(0);

        let trigger = cancel.clone();
        let result: Result<()> = policy
            .execute(&cancel, || {
                if calls.fetch_add(1, Ordering::SeqCst) == 9 {
                    trigger.cancel();
                }
                async { Err(IndexerError::Transient("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(IndexerError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unbounded_attempt_counter_saturates() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay: Duration::ZERO,
            ..no_jitter(None)
        });
        let mut state = RetryState {
            policy: &policy,
            attempt: u32::MAX - 1,
            last_error: None,
        };
        for _ in 0..3 {
            let attempt = state.record(IndexerError::Transient("still down".into())).unwrap();
            assert_eq!(attempt.next_delay, Duration::ZERO);
        }
        assert_eq!(state.attempt, u32::MAX);
    }

    #[test]
    fn test_custom_predicate() {
        let policy = RetryPolicy::new(no_jitter(Some(3))).with_predicate(|kind| {
            matches!(kind, ErrorKind::Transient | ErrorKind::Data)
        });
        let mut state = policy.begin();
        let attempt = state.record(IndexerError::Data("locked".into())).unwrap();
        assert_eq!(attempt.attempt, 1);
        assert_eq!(attempt.last_error, Some(ErrorKind::Data));
        assert!(state.record(IndexerError::Protocol("bad".into())).is_err());
    }
}
