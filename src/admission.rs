// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target capacity admission for baseline and resync transfers.
//!
//! Pairs share nothing except target storage. Before a seed copies blocks it
//! asks for a reservation; the controller admits it when
//!
//! ```text
//! headroom(target) - reserved_total >= required + safety_margin
//! ```
//!
//! and otherwise keeps the request queued, re-polling headroom, until
//! `queue_timeout` passes and the request fails with
//! `TargetCapacityExceeded`. A bulkhead additionally caps how many seeds run
//! at once. Reservations release on drop.

use crate::collaborators::ProvisioningService;
use crate::config::AdmissionConfig;
use crate::error::{ReplicationError, Result};
use crate::model::PairId;
use crate::resilience::Bulkhead;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Arbitrates target capacity between concurrent seeds.
pub struct AdmissionController {
    provisioning: Arc<dyn ProvisioningService>,
    safety_margin: u64,
    queue_timeout: Duration,
    poll_interval: Duration,
    bulkhead: Bulkhead,
    reserved: Arc<Mutex<u64>>,
}

/// An admitted reservation; released on drop.
#[derive(Debug)]
pub struct Reservation {
    pair_id: PairId,
    bytes: u64,
    reserved: Arc<Mutex<u64>>,
    _permit: OwnedSemaphorePermit,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock();
        *reserved = reserved.saturating_sub(self.bytes);
        crate::metrics::set_reserved_capacity(*reserved);
        debug!(pair_id = %self.pair_id, bytes = self.bytes, "Capacity reservation released");
    }
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig, provisioning: Arc<dyn ProvisioningService>) -> Self {
        Self {
            provisioning,
            safety_margin: config.safety_margin_bytes,
            queue_timeout: config.queue_timeout_duration(),
            poll_interval: config.poll_interval_duration(),
            bulkhead: Bulkhead::new(config.max_concurrent_seeds.max(1)),
            reserved: Arc::new(Mutex::new(0)),
        }
    }

    /// Bytes currently reserved by admitted seeds.
    pub fn reserved(&self) -> u64 {
        *self.reserved.lock()
    }

    /// Queue for `required` bytes on `target_ref`.
    ///
    /// Gives up early with `Cancelled` once `cancel` flips to `true`.
    pub async fn reserve(
        &self,
        pair_id: &PairId,
        target_ref: &str,
        required: u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Reservation> {
        let started = Instant::now();
        let deadline = started + self.queue_timeout;

        let permit = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => return Err(ReplicationError::Cancelled),
            permit = self.bulkhead.acquire() => permit?,
        };

        let mut last_available;
        loop {
            let headroom = self.provisioning.capacity_headroom(target_ref).await?;
            {
                let mut reserved = self.reserved.lock();
                last_available = headroom.saturating_sub(*reserved);
                if last_available >= required.saturating_add(self.safety_margin) {
                    *reserved += required;
                    crate::metrics::set_reserved_capacity(*reserved);
                    crate::metrics::record_admission_wait(true, started.elapsed());
                    info!(pair_id = %pair_id, target = %target_ref, required, headroom, "Seed admitted");
                    return Ok(Reservation {
                        pair_id: pair_id.clone(),
                        bytes: required,
                        reserved: Arc::clone(&self.reserved),
                        _permit: permit,
                    });
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            debug!(
                pair_id = %pair_id,
                required,
                available = last_available,
                margin = self.safety_margin,
                "Seed queued for target capacity"
            );
            tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => return Err(ReplicationError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval.min(deadline.saturating_duration_since(Instant::now()))) => {}
            }
        }

        crate::metrics::record_admission_wait(false, started.elapsed());
        warn!(pair_id = %pair_id, target = %target_ref, required, available = last_available, "Admission timed out");
        Err(ReplicationError::TargetCapacityExceeded {
            target_ref: target_ref.to_string(),
            required,
            available: last_available.saturating_sub(self.safety_margin),
        })
    }
}

/// Resolves once the watch holds `true` (or its sender is gone).
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
