//! Bounded, cancelable retry policy
//!
//! Every call site that retries (tunnel creation, login exchange, event
//! stream dial, SSH local dial) runs through [`RetryPolicy::run`] so that
//! attempt accounting, backoff and cancellation behave the same way.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed with an error the caller marked as not retryable
    #[error(transparent)]
    Fatal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("canceled while retrying")]
    Canceled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomise each delay into `[delay / 2, delay]`
    pub jitter: bool,
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay doubles after every failed attempt, up to `max_delay`
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay slept after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            half + rand::thread_rng().gen_range(Duration::ZERO..=half)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails fatally, runs out of attempts, or
    /// `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        is_retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Canceled),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.delay_for(attempt);
            debug!(attempt, max_attempts, "Attempt failed, retrying in {:?}: {}", delay, err);

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
