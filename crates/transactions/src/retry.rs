//! Exponential backoff retry primitives
//!
//! Two bounded retry drivers (wall-clock budget and attempt count) plus two
//! resumable pacer objects for loops that need to sleep between probes
//! without restructuring into a closure.
//!
//! Delays double from `min` up to a cap and are jittered by ±10% so that
//! independent clients probing the same contended document spread out.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Jitter fraction applied to every delay.
pub const RETRY_OP_JITTER: f64 = 0.1;

/// Count-bounded backoff stops doubling at `min * 2^7`.
pub const DEFAULT_RETRY_OP_EXPONENT_CAP: u32 = 7;

/// Signal from a retried operation.
#[derive(Debug)]
pub enum Retryable<E> {
    /// Try again after the next backoff interval.
    Retry,
    /// Give up and propagate.
    Err(E),
}

/// Terminal outcomes of a retry driver.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry operation timed out")]
    Timeout,

    #[error("retry attempts exhausted")]
    RetriesExhausted,

    #[error("operation failed")]
    Op(E),
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - RETRY_OP_JITTER..=1.0 + RETRY_OP_JITTER);
    delay.mul_f64(factor)
}

/// Invoke `op`, retrying with exponential backoff until the cumulative
/// wall-clock `budget` is spent.
///
/// Delays run `min, 2*min, 4*min, ...` capped at `max`, each jittered ±10%.
pub async fn retry_op_exponential_backoff_timeout<T, E, F, Fut>(
    min: Duration,
    max: Duration,
    budget: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Retryable<E>>>,
{
    let start = Instant::now();
    let mut delay = min;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Retryable::Err(e)) => return Err(RetryError::Op(e)),
            Err(Retryable::Retry) => {
                if start.elapsed() >= budget {
                    return Err(RetryError::Timeout);
                }
                tokio::time::sleep(jittered(delay.min(max))).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Invoke `op`, retrying with exponential backoff at most `max_retries`
/// times (so the body runs `max_retries + 1` times in total).
pub async fn retry_op_exponential_backoff<T, E, F, Fut>(
    min: Duration,
    max_retries: u32,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Retryable<E>>>,
{
    let cap = min.saturating_mul(1 << DEFAULT_RETRY_OP_EXPONENT_CAP);
    let mut delay = min;
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Retryable::Err(e)) => return Err(RetryError::Op(e)),
            Err(Retryable::Retry) => {
                if retries == max_retries {
                    return Err(RetryError::RetriesExhausted);
                }
                retries += 1;
                tokio::time::sleep(jittered(delay.min(cap))).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Resumable exponential pacer.
///
/// The first call is free; each subsequent call sleeps the next backoff
/// interval. Errors with [`RetryError::Timeout`] once the budget is spent.
#[derive(Debug, Clone)]
pub struct ExpDelay {
    max: Duration,
    budget: Duration,
    start: Option<Instant>,
    next: Duration,
}

impl ExpDelay {
    pub fn new(min: Duration, max: Duration, budget: Duration) -> Self {
        Self {
            max,
            budget,
            start: None,
            next: min,
        }
    }

    /// Sleep for the next backoff interval.
    pub async fn delay(&mut self) -> Result<(), RetryError<()>> {
        let start = match self.start {
            Some(start) => start,
            None => {
                self.start = Some(Instant::now());
                return Ok(());
            }
        };
        if start.elapsed() >= self.budget {
            return Err(RetryError::Timeout);
        }
        tokio::time::sleep(jittered(self.next.min(self.max))).await;
        self.next = self.next.saturating_mul(2);
        Ok(())
    }
}

/// Fixed-interval pacer bounded by call count.
#[derive(Debug, Clone)]
pub struct ConstantDelay {
    delay: Duration,
    max_calls: u32,
    calls: u32,
}

impl ConstantDelay {
    pub fn new(delay: Duration, max_calls: u32) -> Self {
        Self {
            delay,
            max_calls,
            calls: 0,
        }
    }

    /// Sleep for the fixed interval.
    pub async fn delay(&mut self) -> Result<(), RetryError<()>> {
        self.calls += 1;
        if self.calls > self.max_calls {
            return Err(RetryError::RetriesExhausted);
        }
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RetryState {
        timings: Vec<Instant>,
    }

    impl RetryState {
        fn new() -> Self {
            Self {
                timings: Vec::new(),
            }
        }

        fn record(&mut self) {
            self.timings.push(Instant::now());
        }

        fn differences(&self) -> Vec<Duration> {
            let mut out = Vec::new();
            let mut last = self.timings[0];
            for t in &self.timings {
                out.push(*t - last);
                last = *t;
            }
            out
        }
    }

    const ONE_MS: Duration = Duration::from_millis(1);
    const TEN_MS: Duration = Duration::from_millis(10);
    const HUNDRED_MS: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_exp_backoff_with_timeout_will_timeout() {
        let start = Instant::now();
        let mut state = RetryState::new();
        let result: Result<(), RetryError<()>> =
            retry_op_exponential_backoff_timeout(ONE_MS, TEN_MS, HUNDRED_MS, || {
                state.record();
                async { Err(Retryable::Retry) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Timeout)));
        // sleep is only guaranteed to sleep for at least the time requested,
        // so just make sure the total elapsed time is at least the budget.
        assert!(!state.timings.is_empty());
        assert!(start.elapsed() >= HUNDRED_MS);
    }

    #[tokio::test]
    async fn test_exp_backoff_with_timeout_retry_count_in_range() {
        let mut state = RetryState::new();
        let result: Result<(), RetryError<()>> =
            retry_op_exponential_backoff_timeout(ONE_MS, TEN_MS, HUNDRED_MS, || {
                state.record();
                async { Err(Retryable::Retry) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Timeout)));
        // Delays are 1+2+4+8+10+10+... ±10% jitter, so at the 10% floor the
        // budget is spent after at most 14 sleeps; 15 invocations total.
        assert!(state.timings.len() <= 15);
    }

    #[tokio::test]
    async fn test_exp_backoff_with_timeout_timing_reasonable() {
        let mut state = RetryState::new();
        let result: Result<(), RetryError<()>> =
            retry_op_exponential_backoff_timeout(ONE_MS, TEN_MS, HUNDRED_MS, || {
                state.record();
                async { Err(Retryable::Retry) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Timeout)));

        // Expect gaps of 0, 1, 2, 4, 8, 10, ... ±10%.
        let min_jitter = 1.0 - RETRY_OP_JITTER;
        for (count, gap) in state.differences().iter().enumerate() {
            if count == 0 {
                assert_eq!(*gap, Duration::ZERO);
            } else {
                let expected = ONE_MS.mul_f64(f64::from(1u32 << (count - 1).min(30)));
                let floor = expected.min(TEN_MS).mul_f64(min_jitter);
                assert!(
                    *gap >= floor,
                    "gap {} was {:?}, expected at least {:?}",
                    count,
                    gap,
                    floor
                );
            }
        }
    }

    #[tokio::test]
    async fn test_exp_backoff_always_retries_at_least_once() {
        let mut state = RetryState::new();
        let result: Result<(), RetryError<()>> =
            retry_op_exponential_backoff_timeout(TEN_MS, TEN_MS, TEN_MS, || {
                state.record();
                async { Err(Retryable::Retry) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Timeout)));
        assert!(state.timings.len() >= 2);
    }

    #[tokio::test]
    async fn test_exp_backoff_max_attempts_stops_at_max() {
        let mut state = RetryState::new();
        let result: Result<(), RetryError<()>> =
            retry_op_exponential_backoff(ONE_MS, 20, || {
                state.record();
                async { Err(Retryable::Retry) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::RetriesExhausted)));
        // Initial call plus 20 retries.
        assert_eq!(state.timings.len(), 21);
    }

    #[tokio::test]
    async fn test_exp_backoff_zero_retries_invokes_once() {
        let mut state = RetryState::new();
        let result: Result<(), RetryError<()>> =
            retry_op_exponential_backoff(ONE_MS, 0, || {
                state.record();
                async { Err(Retryable::Retry) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::RetriesExhausted)));
        assert_eq!(state.timings.len(), 1);
    }

    #[tokio::test]
    async fn test_exp_backoff_fatal_error_propagates() {
        let mut calls = 0;
        let result: Result<(), RetryError<&str>> =
            retry_op_exponential_backoff(ONE_MS, 20, || {
                calls += 1;
                async { Err(Retryable::Err("boom")) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Op("boom"))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_exp_delay_can_call_till_timeout() {
        let start = Instant::now();
        let mut state = RetryState::new();
        let mut pacer = ExpDelay::new(ONE_MS, TEN_MS, HUNDRED_MS);
        loop {
            match pacer.delay().await {
                Ok(()) => state.record(),
                Err(e) => {
                    assert!(matches!(e, RetryError::Timeout));
                    break;
                }
            }
        }
        assert!(start.elapsed() >= HUNDRED_MS);
        assert!(state.timings.len() <= 15);
    }

    #[tokio::test]
    async fn test_constant_delay_bounded_by_count() {
        let mut calls = 0;
        let mut pacer = ConstantDelay::new(Duration::from_millis(2), 10);
        loop {
            match pacer.delay().await {
                Ok(()) => calls += 1,
                Err(e) => {
                    assert!(matches!(e, RetryError::RetriesExhausted));
                    break;
                }
            }
        }
        assert_eq!(calls, 10);
    }
}
