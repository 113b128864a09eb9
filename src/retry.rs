use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::{RetryIf, strategy::ExponentialBackoff};
use tracing::warn;

use crate::error::RegistryError;

const fn default_attempts() -> usize {
    3
}

const fn default_retry_base() -> Duration {
    Duration::from_secs(1)
}

/// Bounded exponential backoff: `retry_base`, doubling, `attempts` calls in total.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Backoff {
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(with = "crate::config::duration", default = "default_retry_base")]
    pub retry_base: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_base: default_retry_base(),
        }
    }
}

impl Backoff {
    pub fn new(attempts: usize, retry_base: Duration) -> Self {
        Self {
            attempts,
            retry_base,
        }
    }

    /// The sleeps between attempts; one fewer than `attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        // Powers of two scaled by half the base give base, 2*base, 4*base...
        let half_base = (self.retry_base.as_millis() / 2).min(u64::MAX as u128) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(half_base)
            .take(self.attempts.saturating_sub(1))
    }

    /// Runs `action` until it succeeds, fails permanently or attempts run out.
    pub async fn retry_transient<T, A, F>(&self, what: &str, mut action: A) -> Result<T, RegistryError>
    where
        A: FnMut() -> F,
        F: Future<Output = Result<T, RegistryError>>,
    {
        let attempt = AtomicUsize::new(0);
        RetryIf::start(
            self.delays(),
            || {
                attempt.fetch_add(1, Ordering::Relaxed);
                action()
            },
            |err: &RegistryError| {
                if err.is_transient() {
                    warn!(
                        attempt = attempt.load(Ordering::Relaxed),
                        error = %err,
                        "{what}: transient failure, backing off"
                    );
                    true
                } else {
                    false
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let backoff = Backoff::new(4, Duration::from_secs(1));
        let delays: Vec<Duration> = backoff.delays().collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn single_attempt_never_sleeps() {
        assert_eq!(Backoff::new(1, Duration::from_secs(1)).delays().count(), 0);
        assert_eq!(Backoff::new(0, Duration::from_secs(1)).delays().count(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicUsize::new(0);
        let backoff = Backoff::default();

        let result = backoff
            .retry_transient("listing", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(RegistryError::status(
                        "u",
                        reqwest::StatusCode::BAD_GATEWAY,
                        "",
                    )),
                    _ => Ok(7),
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test(start_paused = true))]
    async fn gives_up_after_the_attempt_cap() {
        let calls = AtomicUsize::new(0);
        let backoff = Backoff::default();

        let result: Result<(), _> = backoff
            .retry_transient("listing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::status("u", reqwest::StatusCode::BAD_GATEWAY, ""))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test(tokio::test(start_paused = true))]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let backoff = Backoff::default();

        let result: Result<(), _> = backoff
            .retry_transient("listing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::status("u", reqwest::StatusCode::NOT_FOUND, ""))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
