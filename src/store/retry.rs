use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use backoff::backoff::Backoff;

/// A bounded retry policy with a fixed delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// The total number of attempts, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a fixed delay policy.
    pub fn fixed_delay(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Build a fresh backoff for this policy.
    pub fn backoff(&self) -> FixedDelayBackoff {
        FixedDelayBackoff {
            delay: self.delay,
            max_attempts: self.max_attempts,
            retries: 0,
        }
    }
}

/// A constant delay backoff which gives up once the policy's attempts are spent.
#[derive(Clone, Debug)]
pub struct FixedDelayBackoff {
    delay: Duration,
    max_attempts: u32,
    retries: u32,
}

impl Backoff for FixedDelayBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries + 1 >= self.max_attempts {
            return None;
        }
        self.retries += 1;
        Some(self.delay)
    }
}

/// Invoke the given operation until it succeeds or the policy's attempts are exhausted.
///
/// Every failure is treated as transient. The error of the final attempt is returned on exhaustion.
pub async fn supply_with_retries<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let res = backoff::future::retry(policy.backoff(), || {
        attempt += 1;
        let current = attempt;
        let fut = op();
        async move {
            fut.await.map_err(|err| {
                tracing::debug!(error = ?err, attempt = current, max_attempts = policy.max_attempts, "{} failed", op_name);
                backoff::Error::Transient(err)
            })
        }
    })
    .await;
    res.map_err(|err| err.context(format!("{} failed after {} attempts", op_name, attempt)))
}
