//! Retry policy for the rewrite collaborator.
//!
//! Only transient failures are retried: timeouts, transport errors, HTTP 429
//! and 5xx (see [`ProposalError::is_retryable`]). Everything else is
//! returned on the first attempt so a bad key or a malformed response is
//! reported immediately.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use self_rewrite_orchestrator::proposal::retry::{RetryPolicy, RetryingProposer};
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_secs(10));
//! let proposer = RetryingProposer::new(inner, policy);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ProposalError, RewriteProposer};

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Delay schedule between attempts.
    pub strategy: RetryStrategy,
}

/// Retry backoff strategy
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff (delay doubles each time, capped)
    Exponential {
        /// Delay before the second attempt.
        initial_delay: Duration,
        /// Upper bound for any single delay.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Create policy with fixed delay
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Fixed(delay),
        }
    }

    /// Create policy with capped exponential backoff
    pub fn exponential(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay,
            },
        }
    }

    /// Policy from `[proposer]` settings.
    pub fn from_config(cfg: &crate::config::ProposerConfig) -> Self {
        Self::exponential(
            cfg.max_attempts.max(1),
            Duration::from_millis(cfg.retry_base_ms),
            Duration::from_millis(cfg.retry_max_ms),
        )
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
            } => {
                let exp = attempt.saturating_sub(1).min(30) as u32;
                let delay = initial_delay.saturating_mul(2u32.saturating_pow(exp));
                delay.min(*max_delay)
            }
        }
    }
}

/// Conditional retry - only retry if predicate returns true
pub async fn retry_if<F, Fut, T, E, P>(policy: &RetryPolicy, mut f: F, mut should_retry: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(attempt = attempt, max = policy.max_attempts, "retry: attempting operation");

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "retry: operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    warn!(error = %e, "retry: error is not retryable");
                    return Err(e);
                }

                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, error = %e, "retry: all attempts exhausted");
                    return Err(e);
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    attempt = attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retry: transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Wraps a proposer and retries its transient failures.
pub struct RetryingProposer {
    inner: Arc<dyn RewriteProposer>,
    policy: RetryPolicy,
}

impl RetryingProposer {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: Arc<dyn RewriteProposer>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl RewriteProposer for RetryingProposer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn propose(&self, target_description: &str, instruction: &str) -> Result<String, ProposalError> {
        retry_if(
            &self.policy,
            || self.inner.propose(target_description, instruction),
            ProposalError::is_retryable,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::ScriptedProposer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_if_succeeds_eventually() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_if(
            &fast(5),
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("failing")
                    } else {
                        Ok("success")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), &str> = retry_if(
            &fast(5),
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count == 0 {
                        Err("transient")
                    } else {
                        Err("permanent")
                    }
                }
            },
            |e| *e == "transient",
        )
        .await;

        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(attempts.load(Ordering::SeqCst), 2); // First attempt + one retry
    }

    #[tokio::test]
    async fn test_retry_if_exhausts_attempts() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), &str> = retry_if(
            &fast(3),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("always fails") }
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy::exponential(6, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retrying_proposer_retries_server_errors() {
        let inner = Arc::new(ScriptedProposer::new(vec![
            Err(ProposalError::Api {
                status: 503,
                body: "overloaded".into(),
            }),
            Err(ProposalError::Timeout(Duration::from_secs(1))),
            Ok("fn f() {}".into()),
        ]));
        let proposer = RetryingProposer::new(inner.clone(), fast(3));
        let text = proposer.propose("target", "improve").await.expect("test: third attempt");
        assert_eq!(text, "fn f() {}");
        assert_eq!(inner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_retrying_proposer_does_not_retry_client_errors() {
        let inner = Arc::new(ScriptedProposer::new(vec![
            Err(ProposalError::Api {
                status: 401,
                body: "bad key".into(),
            }),
            Ok("never reached".into()),
        ]));
        let proposer = RetryingProposer::new(inner.clone(), fast(3));
        let err = proposer.propose("target", "improve").await.unwrap_err();
        assert!(matches!(err, ProposalError::Api { status: 401, .. }));
        assert_eq!(inner.calls().len(), 1);
    }
}
