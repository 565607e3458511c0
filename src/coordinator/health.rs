// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pair health evaluation.
//!
//! Pure function of what the controller observed; the controller runs it on
//! every health tick and acts on the verdict.
//!
//! | Condition (while `Replicating`) | Verdict |
//! |---|---|
//! | transport outage longer than `max_rp_offline` | force resync |
//! | lag longer than `max_rp_interval` | `Degraded` |
//! | neither, currently `Degraded` | back to `OK` |
//!
//! `Broken` is sticky: only a successful operator-driven drive-through clears
//! it, so the monitor leaves it alone and never forces a resync on top of it.

use super::state::PairState;
use crate::model::Health;
use std::time::Duration;

/// Observations for one tick.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub state: PairState,
    pub health: Health,
    pub lag: Duration,
    /// How long the transport has been unreachable, if it is.
    pub outage: Option<Duration>,
    pub max_rp_interval: Duration,
    pub max_rp_offline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Unchanged,
    Healthy,
    Degraded(String),
    ForceResync(String),
}

pub fn evaluate(inputs: &HealthInputs) -> HealthVerdict {
    if inputs.health == Health::Broken || inputs.state != PairState::Replicating {
        return HealthVerdict::Unchanged;
    }

    if let Some(outage) = inputs.outage {
        if outage > inputs.max_rp_offline {
            return HealthVerdict::ForceResync(format!(
                "transport offline for {}ms (limit {}ms)",
                outage.as_millis(),
                inputs.max_rp_offline.as_millis()
            ));
        }
    }

    if inputs.lag > inputs.max_rp_interval {
        if inputs.health == Health::Degraded {
            return HealthVerdict::Unchanged;
        }
        return HealthVerdict::Degraded(format!(
            "no recovery point for {}ms (limit {}ms)",
            inputs.lag.as_millis(),
            inputs.max_rp_interval.as_millis()
        ));
    }

    if inputs.health == Health::Degraded {
        HealthVerdict::Healthy
    } else {
        HealthVerdict::Unchanged
    }
}
