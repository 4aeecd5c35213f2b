use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 0,
        }
    }

    /// `retry_delay_ms * 2^attempt` plus up to 99ms of clock jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        if self.retry_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        let base = self
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable kind, or
    /// the retry budget is spent. The last error is returned unchanged.
    pub fn run<T, E, F, K>(&self, label: &str, mut operation: F, kind_of: K) -> Result<T, E>
    where
        F: FnMut(usize) -> Result<T, E>,
        K: Fn(&E) -> ErrorKind,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let kind = kind_of(&error);
                    if !kind.is_retryable() || attempt >= self.max_retries {
                        if kind.is_retryable() {
                            warn!(label, attempt, %kind, "retry budget exhausted: {error}");
                        }
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        label,
                        attempt,
                        %kind,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying after {error}"
                    );
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Enforces a minimum spacing between consecutive requests to one host.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl RequestPacer {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            last_request_at: None,
            request_count: 0,
        }
    }

    pub fn pace(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RequestPacer, RetryPolicy};
    use crate::error::{ErrorKind, WikiError};

    fn instant_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms: 0,
        }
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 100,
        };
        let first = policy.delay_for(0);
        let third = policy.delay_for(2);
        assert!(first >= Duration::from_millis(100));
        assert!(first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400));
        assert!(third < Duration::from_millis(500));
    }

    #[test]
    fn retries_rate_limited_until_success() {
        let mut calls = 0;
        let result = instant_policy(3).run(
            "fetch",
            |_| {
                calls += 1;
                if calls < 3 {
                    Err(WikiError::RateLimited("slow down".to_string()))
                } else {
                    Ok("page")
                }
            },
            WikiError::kind,
        );
        assert_eq!(result.expect("eventually succeeds"), "page");
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), WikiError> = instant_policy(2).run(
            "fetch",
            |_| {
                calls += 1;
                Err(WikiError::Transient("HTTP 503".to_string()))
            },
            WikiError::kind,
        );
        assert_eq!(result.expect_err("must fail").kind(), ErrorKind::TransientNetwork);
        assert_eq!(calls, 3);
    }

    #[test]
    fn does_not_retry_not_found() {
        let mut calls = 0;
        let result: Result<(), WikiError> = instant_policy(5).run(
            "fetch",
            |_| {
                calls += 1;
                Err(WikiError::NotFound("Ghost".to_string()))
            },
            WikiError::kind,
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn pacer_counts_requests() {
        let mut pacer = RequestPacer::new(0);
        pacer.pace();
        pacer.pace();
        assert_eq!(pacer.request_count(), 2);
    }
}
