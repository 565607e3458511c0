// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic retention sweep.
//!
//! Walks every live pair on a fixed interval and runs the merge/prune steps
//! from [`crate::retention`]. A chain that fails verification is reported to
//! its controller, which marks the pair `Broken`.
//!
//! Pairs that are already `Broken` only get their interrupted merge releases
//! finished; no new steps are planned on a chain that failed verification.
//! Pairs with no chain yet are skipped; an in-progress baseline owns the
//! chain until it installs.

use super::{EngineContext, PairEvent, PairRegistry};
use crate::config::RetentionPolicy;
use crate::error::ReplicationError;
use crate::model::{Health, PairId};
use crate::retention::{self, SweepStats};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Run the sweep loop until shutdown.
pub(crate) async fn run_sweeper(ctx: Arc<EngineContext>, registry: Arc<PairRegistry>, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.settings.sweep.interval_duration();
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(interval_ms = period.as_millis() as u64, "Retention sweep task started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = timer.tick() => {
                let stats = sweep_once(&ctx, &registry).await;
                debug!(pairs = stats.pairs, merged = stats.merged, pruned = stats.pruned, "Sweep tick");
            }
        }
    }

    info!("Retention sweep task stopped");
}

/// One pass over the registry.
pub(crate) async fn sweep_once(ctx: &EngineContext, registry: &PairRegistry) -> SweepStats {
    let snapshots: Vec<_> = registry.read().values().map(|handle| handle.snapshot()).collect();
    let (broken, pairs): (Vec<_>, Vec<_>) = snapshots
        .into_iter()
        .filter(|pair| matches!(ctx.rps.latest(&pair.pair_id), Ok(Some(_))))
        .partition(|pair| pair.health == Health::Broken);
    let pairs: Vec<(PairId, RetentionPolicy)> = pairs.into_iter().map(|pair| (pair.pair_id, pair.policy)).collect();

    let mut released = 0;
    for pair in &broken {
        match retention::release_pending(&ctx.rps, &pair.pair_id).await {
            Ok(n) => released += n,
            Err(e) => warn!(pair_id = %pair.pair_id, error = %e, "Release failed for broken pair"),
        }
    }

    if pairs.is_empty() {
        return SweepStats {
            released,
            ..Default::default()
        };
    }

    let (mut stats, failures) = retention::sweep_all(&ctx.rps, &pairs, &ctx.settings.sweep, ctx.notifier.as_ref()).await;
    stats.released += released;

    for (pair_id, error) in failures {
        if !matches!(error, ReplicationError::ChainCorruption { .. }) {
            continue;
        }
        match registry.read().get(&pair_id) {
            Some(handle) => handle.post(PairEvent::Corruption(error)),
            None => warn!(pair_id = %pair_id, "Corrupt chain for a pair no longer registered"),
        }
    }
    stats
}
