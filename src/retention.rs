// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention & merge engine.
//!
//! Keeps each pair's recovery point chain within its retention policy. Runs
//! as a background sweep, off the ingestion hot path.
//!
//! # Steps
//!
//! Each sweep of a pair performs at most `max_steps_per_pair` steps, each a
//! single [`MergeJob`]:
//!
//! - **Prune**: the oldest RP is past `retention`. Its content folds into its
//!   successor, which becomes the new base.
//! - **Merge**: the oldest non-latest RP is past `merge_delay`. Its delta
//!   folds into its immediate successor.
//!
//! The newest RP is never merged or pruned. With `off_peak_only`, neither
//! runs during peak hours.
//!
//! # Two phases
//!
//! ```text
//!   commit:  successor.delta = merged.delta ∪ successor.delta
//!            successor.pred  = merged.pred
//!            merged.merged_into = successor            (one transaction)
//!   release: delete merged RP and its extents          (idempotent)
//! ```
//!
//! A crash after commit leaves the merged RP marked `merged_into`; the next
//! sweep finishes the release before planning anything new. A crash before
//! commit leaves nothing behind and the step is simply planned again.
//!
//! Every step holds the pair's chain writer lock for that step only, so a
//! long sweep never starves ingestion or sealing.

use crate::config::{RetentionPolicy, SweepConfig};
use crate::error::{ReplicationError, Result};
use crate::model::{PairId, RecoveryPoint, RpId};
use crate::notify::{self, NotificationSink};
use crate::rps::{RecoveryPointStore, RpChain};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why a step folds one RP into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeReason {
    /// Older than `merge_delay`.
    Merge,
    /// Older than `retention`.
    Prune,
}

impl MergeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeReason::Merge => "merge",
            MergeReason::Prune => "prune",
        }
    }
}

/// One planned fold of `merged_rp_id` into its immediate successor.
///
/// Holds only ids; nothing is read or written until [`run`](Self::run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub pair_id: PairId,
    pub merged_rp_id: RpId,
    pub successor_rp_id: RpId,
    pub reason: MergeReason,
}

impl MergeJob {
    /// Commit, then release. Returns the successor as rewritten.
    pub async fn run(&self, rps: &RecoveryPointStore) -> Result<RecoveryPoint> {
        let successor = rps
            .commit_merge(&self.pair_id, self.merged_rp_id, self.successor_rp_id)
            .await?;
        rps.release_merged(&self.pair_id, self.merged_rp_id).await?;
        Ok(successor)
    }
}

/// Outcome of sweeping one or more pairs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub pairs: usize,
    pub merged: usize,
    pub pruned: usize,
    /// Releases finished for merges committed by an earlier sweep.
    pub released: usize,
    pub conflicts: usize,
    /// Pairs skipped because of peak hours.
    pub skipped_peak: usize,
}

impl SweepStats {
    fn absorb(&mut self, other: &SweepStats) {
        self.pairs += other.pairs;
        self.merged += other.merged;
        self.pruned += other.pruned;
        self.released += other.released;
        self.conflicts += other.conflicts;
        self.skipped_peak += other.skipped_peak;
    }
}

fn age(now: DateTime<Utc>, created_at: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or_default()
}

/// Pick the next step for a chain, if any.
pub fn plan_step(pair_id: &PairId, chain: &RpChain, policy: &RetentionPolicy, now: DateTime<Utc>) -> Option<MergeJob> {
    let latest = chain.latest()?.rp.rp_id;
    let job = |merged: RpId, successor: RpId, reason| MergeJob {
        pair_id: pair_id.clone(),
        merged_rp_id: merged,
        successor_rp_id: successor,
        reason,
    };

    let root = chain.root()?;
    if root.rp.rp_id != latest && age(now, root.rp.created_at) > policy.retention_duration() {
        let successor = chain.successor_of(root.rp.rp_id)?;
        return Some(job(root.rp.rp_id, successor.rp.rp_id, MergeReason::Prune));
    }

    if !policy.merge_enabled {
        return None;
    }
    let delay = policy.merge_delay_duration();
    let candidate = chain
        .live()
        .take_while(|e| e.rp.rp_id != latest)
        .find(|e| age(now, e.rp.created_at) > delay)?;
    let successor = chain.successor_of(candidate.rp.rp_id)?;
    Some(job(candidate.rp.rp_id, successor.rp.rp_id, MergeReason::Merge))
}

/// Finish the release phase of merges committed by an earlier sweep.
///
/// Only touches entries already folded into a successor, so it also runs
/// for pairs whose chain fails verification.
pub async fn release_pending(rps: &RecoveryPointStore, pair_id: &PairId) -> Result<usize> {
    let mut released = 0;
    for rp_id in rps.pending_releases(pair_id)? {
        rps.release_merged(pair_id, rp_id).await?;
        released += 1;
        info!(pair_id = %pair_id, rp_id, "Finished interrupted merge release");
    }
    Ok(released)
}

/// Sweep one pair.
///
/// Returns `ChainCorruption` if the chain fails its integrity scan before or
/// after the steps.
pub async fn sweep_pair(
    rps: &RecoveryPointStore,
    pair_id: &PairId,
    policy: &RetentionPolicy,
    config: &SweepConfig,
    sink: &dyn NotificationSink,
    now: DateTime<Utc>,
) -> Result<SweepStats> {
    let mut stats = SweepStats {
        pairs: 1,
        ..Default::default()
    };

    stats.released = release_pending(rps, pair_id).await?;

    if let Err(e) = rps.verify(pair_id) {
        crate::metrics::record_chain_corruption(pair_id.as_str());
        return Err(e);
    }

    if !policy.maintenance_allowed(now) {
        crate::metrics::record_sweep_skipped("peak_hours");
        debug!(pair_id = %pair_id, "Sweep skipped during peak hours");
        stats.skipped_peak = 1;
        return Ok(stats);
    }

    let mut steps = 0;
    let mut conflicts = 0u32;
    while steps < config.max_steps_per_pair {
        let chain = rps.chain(pair_id)?;
        let Some(job) = plan_step(pair_id, &chain, policy, now) else {
            break;
        };

        match job.run(rps).await {
            Ok(successor) => {
                steps += 1;
                match job.reason {
                    MergeReason::Merge => stats.merged += 1,
                    MergeReason::Prune => stats.pruned += 1,
                }
                crate::metrics::record_merge_step(pair_id.as_str(), job.reason.as_str());
                notify::emit(
                    sink,
                    pair_id,
                    job.reason.as_str(),
                    format!("rp {} folded into rp {}", job.merged_rp_id, successor.rp_id),
                );
                debug!(
                    pair_id = %pair_id,
                    merged = job.merged_rp_id,
                    into = successor.rp_id,
                    reason = job.reason.as_str(),
                    "Retention step applied"
                );
            }
            Err(ReplicationError::MergeConflict { .. }) => {
                conflicts += 1;
                stats.conflicts += 1;
                crate::metrics::record_merge_conflict(pair_id.as_str());
                if conflicts > config.merge_conflict_retries {
                    warn!(pair_id = %pair_id, conflicts, "Giving up on merge after repeated conflicts");
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = rps.verify(pair_id) {
        crate::metrics::record_chain_corruption(pair_id.as_str());
        return Err(e);
    }
    Ok(stats)
}

/// Sweep every listed pair; per-pair failures are collected, not fatal.
pub async fn sweep_all(
    rps: &RecoveryPointStore,
    pairs: &[(PairId, RetentionPolicy)],
    config: &SweepConfig,
    sink: &dyn NotificationSink,
) -> (SweepStats, Vec<(PairId, ReplicationError)>) {
    let started = Instant::now();
    let mut total = SweepStats::default();
    let mut failures = Vec::new();

    // Pairs share no chain state.
    let now = Utc::now();
    let results = futures::future::join_all(
        pairs
            .iter()
            .map(|(pair_id, policy)| sweep_pair(rps, pair_id, policy, config, sink, now)),
    )
    .await;

    for ((pair_id, _), result) in pairs.iter().zip(results) {
        match result {
            Ok(stats) => total.absorb(&stats),
            Err(e) => {
                warn!(pair_id = %pair_id, error = %e, "Sweep failed for pair");
                failures.push((pair_id.clone(), e));
            }
        }
    }

    crate::metrics::record_sweep(started.elapsed(), total.merged, total.pruned);
    if total.merged + total.pruned > 0 {
        info!(
            pairs = total.pairs,
            merged = total.merged,
            pruned = total.pruned,
            duration_ms = started.elapsed().as_millis(),
            "Retention sweep complete"
        );
    }
    (total, failures)
}
