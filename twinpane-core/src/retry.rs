//! Opt-in retry for transport failures while establishing connections.
//!
//! Operations themselves are never retried; only [`crate::pool::Pool`] uses
//! this when creating a fresh backend session.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(
            1,
            Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transport() && attempt + 1 < self.attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(attempt, ?delay, error = %err, "connection attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff.delay_with_rng(0, &mut rng),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.delay_with_rng(2, &mut rng),
            Duration::from_millis(400)
        );
        assert_eq!(
            backoff.delay_with_rng(5, &mut rng),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn backoff_with_jitter_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        let delay = backoff.delay_with_rng(3, &mut rng);
        assert!(delay <= Duration::from_millis(800));
    }

    fn quick_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false),
        )
    }

    #[tokio::test]
    async fn retries_transport_failures_until_success() {
        let calls = AtomicU32::new(0);
        let value = quick_policy(3)
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceError::Transport("connection reset".into()))
                } else {
                    Ok("connected")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_configured_attempts() {
        let calls = AtomicU32::new(0);
        let err = quick_policy(2)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::Transport("refused".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let err = quick_policy(5)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::NotFound("/x".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
