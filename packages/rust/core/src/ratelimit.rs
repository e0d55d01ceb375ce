//! Token-bucket rate limiting, one bucket per external service.
//!
//! Buckets refill continuously from elapsed time; nothing runs in the
//! background. `acquire` sleeps until a token is available or the bucket's
//! maximum wait would be exceeded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use streamdigest_shared::{BucketConfig, DigestError, RateLimitsConfig, Result};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket shared by every caller of one service.
#[derive(Debug)]
pub struct TokenBucket {
    service: String,
    capacity: f64,
    /// Tokens restored per second.
    rate: f64,
    max_wait: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(service: impl Into<String>, config: &BucketConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            service: service.into(),
            capacity,
            rate: f64::from(config.refill_per_minute) / 60.0,
            max_wait: config.max_wait(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Take one token, waiting up to the configured maximum.
    pub async fn acquire(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                self.time_to_next_token(state.tokens)
            };

            let waited = started.elapsed();
            let exhausted = match wait {
                Some(wait) => waited + wait > self.max_wait,
                None => true,
            };
            if exhausted {
                warn!(service = %self.service, waited_ms = waited.as_millis() as u64, "rate limit exceeded");
                return Err(DigestError::RateLimitExceeded {
                    service: self.service.clone(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            // `exhausted` is false only when a finite wait exists.
            let wait = wait.unwrap_or_default();
            debug!(service = %self.service, wait_ms = wait.as_millis() as u64, "waiting for token");
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    fn time_to_next_token(&self, tokens: f64) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        let secs = ((1.0 - tokens) / self.rate).max(0.0);
        // Round up to the next millisecond so the token is there on wake.
        Some(Duration::from_millis((secs * 1000.0).ceil() as u64))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // A poisoned bucket still holds a valid token count.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The process-wide buckets, injected into the orchestrator.
#[derive(Debug, Clone)]
pub struct RateLimiters {
    pub text: Arc<TokenBucket>,
    pub image: Arc<TokenBucket>,
    pub shortener: Arc<TokenBucket>,
}

impl RateLimiters {
    pub fn new(text: &str, image: &str, shortener: &str, config: &RateLimitsConfig) -> Self {
        Self {
            text: Arc::new(TokenBucket::new(text, &config.text)),
            image: Arc::new(TokenBucket::new(image, &config.image)),
            shortener: Arc::new(TokenBucket::new(shortener, &config.shortener)),
        }
    }
}

impl From<&RateLimitsConfig> for RateLimiters {
    fn from(config: &RateLimitsConfig) -> Self {
        Self::new("text", "image", "shortener", config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: u32, refill_per_minute: u32, max_wait_ms: u64) -> TokenBucket {
        TokenBucket::new(
            "openai",
            &BucketConfig {
                capacity,
                refill_per_minute,
                max_wait_ms,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let bucket = bucket(3, 60, 0);
        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(bucket.available() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_delays_until_refill() {
        // One token per second.
        let bucket = bucket(1, 60, 5_000);
        bucket.acquire().await.unwrap();

        let start = Instant::now();
        bucket.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1_100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_beyond_max_fails() {
        // One token per minute, but only willing to wait 2 seconds.
        let bucket = bucket(1, 1, 2_000);
        bucket.acquire().await.unwrap();

        let err = bucket.acquire().await.unwrap_err();
        match err {
            DigestError::RateLimitExceeded { service, .. } => assert_eq!(service, "openai"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_never_recovers() {
        let bucket = bucket(1, 0, 60_000);
        bucket.acquire().await.unwrap();
        assert!(matches!(
            bucket.acquire().await,
            Err(DigestError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let bucket = bucket(2, 60, 0);
        bucket.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!((bucket.available() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn limiters_from_config() {
        let limiters = RateLimiters::from(&RateLimitsConfig::default());
        assert_eq!(limiters.text.service(), "text");
        assert_eq!(limiters.image.service(), "image");
        assert_eq!(limiters.shortener.service(), "shortener");
    }
}
