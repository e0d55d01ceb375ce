//! Bounded retry with exponential backoff for external service calls.
//!
//! Every attempt takes a rate-limit token and runs under a per-call timeout.
//! Retryable failures back off `base * 2^(n-1)` plus random jitter; fatal
//! failures (rejected credentials, malformed prompt) stop immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use streamdigest_shared::{DigestError, Operation, RetryPolicy, ServiceError};

use crate::ratelimit::TokenBucket;

/// Everything one retried call needs besides the call itself.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// Service name used when classifying timeouts.
    pub service: &'a str,
    pub policy: &'a RetryPolicy,
    pub bucket: &'a TokenBucket,
    pub call_timeout: Duration,
    pub cancel: &'a CancellationToken,
    pub operation: Operation,
}

/// A call that failed for good.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: DigestError,
    /// Attempts dispatched, including the failed one.
    pub attempts: u32,
    /// Attempts the policy would still have allowed.
    pub retries_remaining: u32,
}

impl RetryFailure {
    fn new(error: DigestError, attempts: u32, max_attempts: u32) -> Self {
        Self {
            error,
            attempts,
            retries_remaining: max_attempts.saturating_sub(attempts),
        }
    }
}

/// Run `call` until it succeeds, fails fatally, or the attempts run out.
///
/// `call` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    ctx: RetryContext<'_>,
    mut call: F,
) -> std::result::Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, ServiceError>>,
{
    let max_attempts = ctx.policy.max_attempts.max(1);
    let cancelled = || DigestError::Cancelled {
        operation: ctx.operation,
    };
    let mut attempt = 0;

    loop {
        attempt += 1;

        let dispatched = async {
            ctx.bucket.acquire().await?;
            let result = tokio::time::timeout(ctx.call_timeout, call(attempt))
                .await
                .unwrap_or_else(|_| Err(ServiceError::timeout(ctx.service, ctx.call_timeout)));
            Ok::<_, DigestError>(result)
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(RetryFailure::new(cancelled(), attempt, max_attempts));
            }
            outcome = dispatched => outcome,
        };

        let err = match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(service = ctx.service, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            // No token within the allowed wait.
            Err(e) => return Err(RetryFailure::new(e, attempt, max_attempts)),
            Ok(Err(e)) => e,
        };

        if !err.is_retryable() {
            warn!(service = ctx.service, kind = %err.kind, "fatal service error, not retrying");
            return Err(RetryFailure::new(err.into(), attempt, max_attempts));
        }
        if attempt >= max_attempts {
            warn!(service = ctx.service, attempts = attempt, kind = %err.kind, "retries exhausted");
            return Err(RetryFailure::new(err.into(), attempt, max_attempts));
        }

        let delay = ctx.policy.backoff(attempt) + jitter(ctx.policy.jitter_ms);
        warn!(
            service = ctx.service,
            attempt,
            kind = %err.kind,
            delay_ms = delay.as_millis() as u64,
            "retryable service error, backing off"
        );

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(RetryFailure::new(cancelled(), attempt, max_attempts));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use streamdigest_shared::{ArtifactType, BucketConfig, FailureKind};
    use tokio::time::Instant;

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 0,
        }
    }

    fn bucket(capacity: u32) -> TokenBucket {
        TokenBucket::new(
            "openai",
            &BucketConfig {
                capacity,
                refill_per_minute: 0,
                max_wait_ms: 0,
            },
        )
    }

    fn ctx<'a>(
        policy: &'a RetryPolicy,
        bucket: &'a TokenBucket,
        cancel: &'a CancellationToken,
    ) -> RetryContext<'a> {
        RetryContext {
            service: "openai",
            policy,
            bucket,
            call_timeout: Duration::from_secs(5),
            cancel,
            operation: Operation::GenerateCandidates(ArtifactType::Tagline),
        }
    }

    fn failing(kind: FailureKind) -> ServiceError {
        ServiceError::new("openai", kind, "boom")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let (policy, bucket, cancel) = (policy(3), bucket(10), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = with_retry(ctx(&policy, &bucket, &cancel), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(failing(FailureKind::Transient))
                } else {
                    Ok("tagline")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "tagline");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100 ms after the first failure, 200 ms after the second.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_stops_immediately() {
        let (policy, bucket, cancel) = (policy(5), bucket(10), CancellationToken::new());
        let calls = AtomicU32::new(0);

        let failure = with_retry(ctx(&policy, &bucket, &cancel), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(failing(FailureKind::InvalidCredentials)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.retries_remaining, 4);
        assert!(!failure.error.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_report_last_error() {
        let (policy, bucket, cancel) = (policy(2), bucket(10), CancellationToken::new());

        let failure = with_retry(ctx(&policy, &bucket, &cancel), |_| async {
            Err::<(), _>(failing(FailureKind::RateLimited))
        })
        .await
        .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.retries_remaining, 0);
        match failure.error {
            DigestError::Service(e) => assert_eq!(e.kind, FailureKind::RateLimited),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_is_retried() {
        let (policy, bucket, cancel) = (policy(2), bucket(10), CancellationToken::new());
        let mut context = ctx(&policy, &bucket, &cancel);
        context.call_timeout = Duration::from_millis(50);

        let result = with_retry(context, |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok::<_, ServiceError>(attempt)
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_takes_a_token() {
        let (policy, cancel) = (policy(5), CancellationToken::new());
        let bucket = bucket(2);

        let failure = with_retry(ctx(&policy, &bucket, &cancel), |_| async {
            Err::<(), _>(failing(FailureKind::Transient))
        })
        .await
        .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert!(matches!(failure.error, DigestError::RateLimitExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let (policy, bucket) = (policy(3), bucket(10));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        let counter = calls.clone();
        let failure = with_retry(ctx(&policy, &bucket, &cancel), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            trigger.cancel();
            async { Err::<(), _>(failing(FailureKind::Transient)) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(failure.error, DigestError::Cancelled { .. }));
    }
}
