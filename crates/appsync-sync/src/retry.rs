//! Bounded retry with a pluggable failure classifier.

use std::future::Future;
use std::time::Duration;

use appsync_providers::RetryDisposition;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; at most `max_retries + 1` calls are made.
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::Fixed(Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("permanent failure: {0}")]
    Permanent(E),
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("unclassified failure: {0}")]
    Unknown(E),
}

impl RetryPolicy {
    /// Calls `op` until it succeeds, `classify` rules the error out, or retries run out.
    ///
    /// `op` receives the zero-based attempt index.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match classify(&err) {
                RetryDisposition::Permanent => return Err(RetryError::Permanent(err)),
                RetryDisposition::Unknown => return Err(RetryError::Unknown(err)),
                RetryDisposition::Transient if attempt >= self.max_retries => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                RetryDisposition::Transient => {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
