// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! Errors are grouped by how the core reacts to them, not by where they
//! originate. Every variant has a stable machine-readable [`kind`](ReplicationError::kind)
//! so operators and tooling can branch on it without parsing messages.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Effect on the pair |
//! |------------|-----------|--------------------|
//! | `InvalidTransition` | No | Command rejected locally, pair untouched |
//! | `TransportDisconnected` | Yes | Backoff; resync once `max_rp_offline` is exceeded |
//! | `AuthExpired` | Yes | Credential refresh, then retry |
//! | `TargetCapacityExceeded` | Yes | Queued; `Broken` if still unsatisfied at timeout |
//! | `ChainCorruption` | No | `Broken`, operator must resync |
//! | `MergeConflict` | Yes | Merge step re-planned by the sweep |
//! | `DeltaEvicted` | No | Buffered delta gone, full resync required |
//! | `ConsistencyHandshake` | Yes | ACRP interval skipped |
//! | `SourceBufferFull` | Yes | Source write rejected under pause-writes |
//! | `MalformedRecord` / `Decompression` | No | `Broken` (bad data on the wire) |
//! | `Store` | No | Local SQLite failure, needs attention |
//! | `Config` / `InvalidState` / `Shutdown` / `Cancelled` / `Internal` | No | Caller error or teardown |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether to back off and
//! try again. Only errors that preclude further automatic progress escalate
//! to `Broken` health.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur in the replication core.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// An operator command is not valid from the pair's current state.
    #[error("Invalid transition for pair {pair_id}: cannot {command} while {state}")]
    InvalidTransition {
        pair_id: String,
        command: String,
        state: String,
    },

    /// The transport lost its connection to the source.
    #[error("Transport disconnected ({source_ref}): {message}")]
    TransportDisconnected { source_ref: String, message: String },

    /// Transport credentials expired and must be refreshed.
    #[error("Credentials expired for {source_ref}")]
    AuthExpired { source_ref: String },

    /// Not enough headroom on the target to admit a seed transfer.
    #[error("Target capacity exceeded on {target_ref}: need {required} bytes, {available} available")]
    TargetCapacityExceeded {
        target_ref: String,
        required: u64,
        available: u64,
    },

    /// The recovery point chain failed a linkage integrity check.
    #[error("Recovery point chain corrupted for pair {pair_id} at rp {rp_id}: {detail}")]
    ChainCorruption {
        pair_id: String,
        rp_id: u64,
        detail: String,
    },

    /// A merge step raced with another chain mutation.
    #[error("Merge conflict for pair {pair_id} on rp {rp_id}")]
    MergeConflict { pair_id: String, rp_id: u64 },

    /// The source evicted buffered changes the consumer still needed.
    #[error("Buffered delta evicted: requested after {requested}, oldest available {oldest_available}")]
    DeltaEvicted { requested: u64, oldest_available: u64 },

    /// The source refused or failed the application-consistency handshake.
    #[error("Consistency handshake failed: {0}")]
    ConsistencyHandshake(String),

    /// The source change buffer is full and the overflow policy pauses writes.
    #[error("Source change buffer full ({capacity} records)")]
    SourceBufferFull { capacity: usize },

    /// Unknown pair id.
    #[error("Pair not found: {0}")]
    PairNotFound(String),

    /// A recovery target did not resolve to a retained recovery point.
    #[error("Recovery point not found for pair {pair_id}: {target}")]
    RecoveryPointNotFound { pair_id: String, target: String },

    /// A change record failed validation.
    #[error("Malformed change record: {0}")]
    MalformedRecord(String),

    /// Zstd decompression failure.
    ///
    /// Occurs when a change payload is corrupted or truncated in transit.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// SQLite error in the metadata store.
    #[error("Metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. pair operations before `start()`).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A baseline or resync was interrupted at a checkpoint boundary.
    #[error("Operation cancelled")]
    Cancelled,

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Build an [`InvalidTransition`](Self::InvalidTransition) error.
    pub fn invalid_transition(
        pair_id: impl ToString,
        command: impl ToString,
        state: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            pair_id: pair_id.to_string(),
            command: command.to_string(),
            state: state.to_string(),
        }
    }

    /// Build a [`TransportDisconnected`](Self::TransportDisconnected) error.
    pub fn disconnected(source_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportDisconnected {
            source_ref: source_ref.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportDisconnected { .. } => true,
            Self::AuthExpired { .. } => true,
            Self::TargetCapacityExceeded { .. } => true, // queued until timeout
            Self::MergeConflict { .. } => true,
            Self::ConsistencyHandshake(_) => true,
            Self::SourceBufferFull { .. } => true,
            Self::InvalidTransition { .. } => false,
            Self::ChainCorruption { .. } => false,
            Self::DeltaEvicted { .. } => false,
            Self::PairNotFound(_) => false,
            Self::RecoveryPointNotFound { .. } => false,
            Self::MalformedRecord(_) => false,
            Self::Decompression(_) => false,
            Self::Store(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Cancelled => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Stable snake_case identifier for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::TransportDisconnected { .. } => "transport_disconnected",
            Self::AuthExpired { .. } => "auth_expired",
            Self::TargetCapacityExceeded { .. } => "target_capacity_exceeded",
            Self::ChainCorruption { .. } => "chain_corruption",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::DeltaEvicted { .. } => "delta_evicted",
            Self::ConsistencyHandshake(_) => "consistency_handshake",
            Self::SourceBufferFull { .. } => "source_buffer_full",
            Self::PairNotFound(_) => "pair_not_found",
            Self::RecoveryPointNotFound { .. } => "recovery_point_not_found",
            Self::MalformedRecord(_) => "malformed_record",
            Self::Decompression(_) => "decompression",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error leaves the pair unable to make automatic progress.
    ///
    /// Fatal errors downgrade health to `Broken` and wait for an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChainCorruption { .. }
                | Self::TargetCapacityExceeded { .. }
                | Self::MalformedRecord(_)
                | Self::Decompression(_)
                | Self::DeltaEvicted { .. }
                | Self::Store(_)
                | Self::Internal(_)
        )
    }

    /// Build the user-visible failure report for a pair.
    pub fn report(&self, pair_id: impl ToString, last_good_sequence: u64) -> FailureReport {
        FailureReport {
            pair_id: pair_id.to_string(),
            last_good_sequence,
            kind: self.kind().to_string(),
            message: self.to_string(),
            at: chrono::Utc::now(),
        }
    }
}

/// A failure as surfaced to operators.
///
/// Always carries the pair, the last sequence known to be durable on the
/// target, and the machine-readable error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub pair_id: String,
    pub last_good_sequence: u64,
    pub kind: String,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}
