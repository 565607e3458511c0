// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry logic, backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`] / [`retry`]: bounded exponential backoff for transient failures
//! - [`RateLimiter`]: token bucket so seed transfers cannot starve live delivery
//! - [`Bulkhead`]: semaphore limiting concurrent seed transfers
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), volume_replication::resilience::BulkheadFull> {
//! use volume_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! // At most 4 seeds copying at once, each paced at 64 chunks/sec
//! let seeds = Bulkhead::new(4);
//! let _slot = seeds.acquire().await?;
//! let pacing = RateLimiter::new(RateLimitConfig::default());
//! pacing.acquire().await;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    /// Set to `usize::MAX` to retry forever.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Bounded retry for seed block reads.
    ///
    /// A seed that cannot read a block after this schedule fails the attempt;
    /// the pair then reports `Broken` and an operator retry starts over.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        200ms
    /// 2        400ms
    /// 3        800ms
    /// 4        1.6s
    /// 5        (give up)
    /// ```
    pub fn seed(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each operation consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 64 chunks/sec with burst of 16.
    fn default() -> Self {
        Self {
            burst_size: 16,
            refill_rate: 64,
        }
    }
}

/// Chunk-level token bucket for seed transfers.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Wait for the next chunk slot. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// The bulkhead's semaphore was closed while waiting.
#[derive(Debug, Clone, thiserror::Error)]
#[error("seed bulkhead closed (limit {max_concurrent})")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

impl From<BulkheadFull> for ReplicationError {
    fn from(e: BulkheadFull) -> Self {
        ReplicationError::Internal(e.to_string())
    }
}

/// Caps how many seeds (baseline or full resync) copy at once.
///
/// A seed holds its permit from admission until it installs or fails.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a seed slot; the slot frees when the permit drops.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Seed slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_delay_never_overflows() {
        let config = RetryConfig {
            max_attempts: usize::MAX,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(10_000), config.max_delay);
        assert_eq!(config.delay_for_attempt(usize::MAX), config.max_delay);
    }

    #[test]
    fn test_seed_preset() {
        let config = RetryConfig::seed(5);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = retry(&RetryConfig::testing(), "flaky_op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ReplicationError::disconnected("vol", "blip"))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(&RetryConfig::testing(), "flaky_op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ReplicationError::Decompression("bad frame".into()))
        })
        .await;

        assert!(matches!(result, Err(ReplicationError::Decompression(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(&RetryConfig::testing(), "flaky_op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ReplicationError::disconnected("vol", "down"))
        })
        .await;

        assert!(matches!(result, Err(ReplicationError::TransportDisconnected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limiter_burst_then_paced() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 20,
        });

        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(30), "burst should not wait");

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40), "fourth chunk waits for a refill");
        assert_eq!(limiter.config().refill_rate, 20);
    }

    #[tokio::test]
    async fn test_zero_rate_is_clamped() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        // One token is always allowed.
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bulkhead_counts_permits() {
        let bulkhead = Bulkhead::new(2);
        let p1 = bulkhead.acquire().await.unwrap();
        let _p2 = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.available(), 0);
        drop(p1);
        assert_eq!(bulkhead.available(), 1);
    }

    #[tokio::test]
    async fn test_bulkhead_acquire_waits() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let bulkhead2 = Arc::clone(&bulkhead);

        let permit = bulkhead.acquire().await.unwrap();

        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            let _p = bulkhead2.acquire().await.unwrap();
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);

        let wait_time = handle.await.unwrap();
        assert!(wait_time >= Duration::from_millis(40), "should have waited");
    }

    #[test]
    fn test_bulkhead_full_error() {
        let err = BulkheadFull { max_concurrent: 4 };
        assert_eq!(err.to_string(), "seed bulkhead closed (limit 4)");
        let converted: ReplicationError = err.into();
        assert_eq!(converted.kind(), "internal");
    }
}
