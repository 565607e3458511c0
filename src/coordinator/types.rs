// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and health report types.
//!
//! # Engine lifecycle
//!
//! ```text
//!            start()                  shutdown()
//! Created ──────────► Starting ──► Running ──────────► ShuttingDown ──► Stopped
//!                        │
//!                        │ (store unavailable)
//!                        ↓
//!                      Failed
//! ```
//!
//! - **Created**: after `ReplicationEngine::new()`. No store is open.
//! - **Starting**: opening the metadata store and reloading pairs.
//! - **Running**: controllers and the retention sweep are live.
//! - **ShuttingDown**: workers are being cancelled at their next checkpoint.
//! - **Stopped**: store checkpointed and closed.
//! - **Failed**: start could not complete.

use super::state::PairState;
use crate::model::{Health, PairId};
use serde::Serialize;
use std::collections::BTreeMap;

/// State of the replication engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Call [`start()`](super::ReplicationEngine::start) to begin.
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    /// Check logs for the cause.
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-wide health summary for monitoring endpoints.
///
/// Built from cached controller snapshots; no store or transport I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Engine is running and accepting commands.
    pub ready: bool,
    /// Ready and no pair is `Broken`.
    pub healthy: bool,
    pub pairs_total: usize,
    /// Pair count per lifecycle state.
    pub states: BTreeMap<&'static str, usize>,
    pub pairs_degraded: usize,
    pub pairs_broken: usize,
    pub pairs: Vec<PairHealth>,
}

/// One pair's entry in a [`HealthCheck`].
#[derive(Debug, Clone, Serialize)]
pub struct PairHealth {
    pub pair_id: PairId,
    pub state: PairState,
    pub health: Health,
    pub current_sequence: u64,
    pub lag_ms: u64,
    /// Kind of the last recorded failure, if any.
    pub last_failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_health_check_serializes() {
        let check = HealthCheck {
            state: EngineState::Running,
            ready: true,
            healthy: false,
            pairs_total: 1,
            states: BTreeMap::from([("Replicating", 1)]),
            pairs_degraded: 0,
            pairs_broken: 1,
            pairs: vec![PairHealth {
                pair_id: PairId::from("p-1"),
                state: PairState::Replicating,
                health: Health::Broken,
                current_sequence: 42,
                lag_ms: 0,
                last_failure: Some("chain_corruption".into()),
            }],
        };
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["state"], "Running");
        assert_eq!(json["pairs"][0]["health"], "Broken");
        assert_eq!(json["states"]["Replicating"], 1);
    }
}
