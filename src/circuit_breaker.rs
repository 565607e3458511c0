// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers for the live delivery path.
//!
//! A flapping source link or a struggling target store should not be hammered
//! by a tight fetch/ingest loop. Each pair's delivery task owns a
//! [`DeliveryCircuit`] that wraps transport fetches and target-side ingestion
//! with `recloser` breakers.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Calls fail fast with [`CircuitError::Rejected`]
//! - **HalfOpen**: Probing whether the dependency recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use volume_replication::circuit_breaker::{DeliveryCircuit, CircuitConfig, CircuitError};
//! # async fn example() {
//! let circuit = DeliveryCircuit::new(CircuitConfig::default());
//!
//! match circuit.fetch.call(|| async { Ok::<u32, String>(1) }).await {
//!     Ok(_) => { /* records delivered */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, back off */ }
//!     Err(CircuitError::Inner(_e)) => { /* transport error */ }
//! }
//! # }
//! ```

use crate::error::ReplicationError;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl CircuitError<ReplicationError> {
    /// Flatten into a replication error; a rejection reads as a disconnect
    /// of the named dependency.
    pub fn into_replication(self, dependency: &str) -> ReplicationError {
        match self {
            CircuitError::Rejected => ReplicationError::disconnected(dependency, "circuit open"),
            CircuitError::Inner(e) => e,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips faster and recovers cautiously; used for target-side writes.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Fast recovery for testing.
    #[must_use]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_rejection(&self.name);
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// The pair of breakers guarding one pair's delivery loop.
pub struct DeliveryCircuit {
    /// Transport fetches from the source.
    pub fetch: CircuitBreaker,
    /// Ingestion into the recovery point store.
    pub ingest: CircuitBreaker,
}

impl DeliveryCircuit {
    /// Fetch circuit uses `fetch_config`; ingest is always aggressive.
    pub fn new(fetch_config: CircuitConfig) -> Self {
        Self {
            fetch: CircuitBreaker::new("transport_fetch", fetch_config),
            ingest: CircuitBreaker::new("rps_ingest", CircuitConfig::aggressive()),
        }
    }
}
