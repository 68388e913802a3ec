use crate::ingest::circuit_breaker::CircuitBreaker;
use crate::ingest::error::FetchError;
use crate::ingest::interrupt::Interrupt;
use std::future::Future;
use std::time::Duration;

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            max_retries: crate::config::env_or("RATINGS_API_RETRIES", DEFAULT_RETRIES),
            base_backoff: Duration::from_millis(crate::config::env_or(
                "RATINGS_API_BACKOFF_MS",
                DEFAULT_BACKOFF_MS,
            )),
        }
    }

    /// `base * 2^attempt`, where `attempt` counts from zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
    }
}

/// Runs `op` until it succeeds, fails non-retryably, exhausts the policy or is interrupted.
pub async fn with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    interrupt: &Interrupt,
    breaker: Option<&CircuitBreaker>,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if let Some(cb) = breaker {
            cb.try_acquire()
                .map_err(|remaining| FetchError::CircuitOpen { remaining })?;
        }

        let res = match interrupt.run(op()).await {
            Ok(res) => res,
            Err(reason) => {
                if let Some(cb) = breaker {
                    cb.release_probe();
                }
                return Err(FetchError::Cancelled(reason));
            }
        };

        let err = match res {
            Ok(v) => {
                if let Some(cb) = breaker {
                    cb.record_success();
                }
                return Ok(v);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            if let Some(cb) = breaker {
                cb.release_probe();
            }
            return Err(err);
        }

        if let Some(cb) = breaker {
            cb.record_failure();
        }

        if attempt >= policy.max_retries {
            return Err(FetchError::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            });
        }

        let backoff = policy.backoff(attempt);
        tracing::warn!(attempt, ?backoff, error = %err, "{what} failed; retrying");
        interrupt
            .sleep(backoff)
            .await
            .map_err(FetchError::Cancelled)?;
        attempt += 1;
    }
}
