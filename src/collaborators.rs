// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Seams to the services the core consumes but does not own.
//!
//! - [`ProvisioningService`]: target placement is already resolved; the core
//!   only asks for capacity headroom (admission control) and releases a
//!   target when a pair is deleted.
//! - [`CredentialProvider`]: short-lived transport credentials. The core
//!   treats refresh as opaque and retries on `AuthExpired`.
//!
//! Standalone implementations are provided for embedding and tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use volume_replication::collaborators::{BoxFuture, ProvisioningService};
//!
//! struct FixedHeadroom(u64);
//!
//! impl ProvisioningService for FixedHeadroom {
//!     fn capacity_headroom(&self, _target_ref: &str) -> BoxFuture<'_, u64> {
//!         let headroom = self.0;
//!         Box::pin(async move { Ok(headroom) })
//!     }
//!
//!     fn release_target(&self, _target_ref: &str) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Target-side provisioning, as far as the core needs it.
pub trait ProvisioningService: Send + Sync + 'static {
    /// Bytes currently free on the target volume's backing storage.
    fn capacity_headroom(&self, target_ref: &str) -> BoxFuture<'_, u64>;

    /// Give back target storage for a deleted pair.
    fn release_target(&self, target_ref: &str) -> BoxFuture<'_, ()>;
}

/// A short-lived transport credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Identity / credential store.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Obtain a fresh credential for the source volume.
    fn fetch(&self, source_ref: &str) -> BoxFuture<'_, Credential>;
}

/// Provisioning with a single, adjustable headroom figure.
#[derive(Debug, Default)]
pub struct StaticProvisioning {
    headroom: AtomicU64,
    released: Mutex<Vec<String>>,
}

impl StaticProvisioning {
    pub fn new(headroom: u64) -> Self {
        Self {
            headroom: AtomicU64::new(headroom),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Effectively unlimited headroom.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX / 2)
    }

    pub fn set_headroom(&self, bytes: u64) {
        self.headroom.store(bytes, Ordering::Relaxed);
    }

    /// Targets released so far.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

impl ProvisioningService for StaticProvisioning {
    fn capacity_headroom(&self, _target_ref: &str) -> BoxFuture<'_, u64> {
        let headroom = self.headroom.load(Ordering::Relaxed);
        Box::pin(async move { Ok(headroom) })
    }

    fn release_target(&self, target_ref: &str) -> BoxFuture<'_, ()> {
        let target_ref = target_ref.to_string();
        Box::pin(async move {
            self.released.lock().push(target_ref);
            Ok(())
        })
    }
}

/// Issues random tokens with a fixed lifetime.
#[derive(Debug)]
pub struct StaticCredentials {
    ttl: Duration,
    issued: AtomicU64,
}

impl StaticCredentials {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: AtomicU64::new(0),
        }
    }

    /// Number of credentials handed out.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl CredentialProvider for StaticCredentials {
    fn fetch(&self, _source_ref: &str) -> BoxFuture<'_, Credential> {
        self.issued.fetch_add(1, Ordering::Relaxed);
        let expires_at = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        Box::pin(async move {
            Ok(Credential {
                token: uuid::Uuid::new_v4().to_string(),
                expires_at,
            })
        })
    }
}
