use std::{future::Future, time::Duration};

/// Bounded retries with linear backoff: after attempt `n` fails the next one
/// starts `n * 2` backoff units later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt.saturating_mul(2)
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Failed { last: E, attempts: u32 },
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
/// `op` receives the 1-based attempt number; `on_retry` sees each failure that
/// will be retried together with the delay before the next attempt.
/// At least one attempt is always made.
pub async fn retry<T, E, F, Fut, R>(policy: RetryPolicy, mut op: F, mut on_retry: R) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, Duration, &E),
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return RetryOutcome::Success { value, attempts: attempt },
            Err(last) if attempt >= policy.max_attempts => {
                return RetryOutcome::Failed { last, attempts: attempt };
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                on_retry(attempt, delay, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
