// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model: pairs, change records, recovery points.

use crate::config::RetentionPolicy;
use crate::coordinator::PairState;
use crate::error::{FailureReport, ReplicationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a recovery point, unique and increasing within a pair.
pub type RpId = u64;

/// Identifier of a replication pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(String);

impl PairId {
    /// Allocate a fresh random pair id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PairId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PairId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pair health, orthogonal to its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    #[serde(rename = "OK")]
    Ok,
    Degraded,
    Broken,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "OK",
            Health::Degraded => "Degraded",
            Health::Broken => "Broken",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Health {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Health::Ok),
            "Degraded" => Ok(Health::Degraded),
            "Broken" => Ok(Health::Broken),
            other => Err(ReplicationError::Internal(format!("unknown health {:?}", other))),
        }
    }
}

/// Consistency class of a recovery point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpKind {
    /// Crash-consistent: sealed on a wall-clock interval.
    #[serde(rename = "CCRP")]
    Ccrp,
    /// Application-consistent: sealed after a successful quiesce handshake.
    #[serde(rename = "ACRP")]
    Acrp,
}

impl RpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpKind::Ccrp => "CCRP",
            RpKind::Acrp => "ACRP",
        }
    }
}

impl fmt::Display for RpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpKind {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CCRP" => Ok(RpKind::Ccrp),
            "ACRP" => Ok(RpKind::Acrp),
            other => Err(ReplicationError::Internal(format!("unknown rp kind {:?}", other))),
        }
    }
}

/// One captured source write.
///
/// `payload` may arrive zstd-compressed from the transport; `length` is
/// always the uncompressed byte count written at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub pair_id: PairId,
    pub sequence: u64,
    pub offset: u64,
    pub length: u64,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    /// First byte past the write, if it is addressable.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// Check that the payload length matches the declared write length and
    /// that the write is addressable.
    pub fn validate(&self) -> Result<(), ReplicationError> {
        if self.sequence == 0 {
            return Err(ReplicationError::MalformedRecord("sequence 0 is reserved".into()));
        }
        if self.end().is_none() {
            return Err(ReplicationError::MalformedRecord(format!(
                "sequence {}: {} bytes at offset {} overflow the address space",
                self.sequence, self.length, self.offset
            )));
        }
        if self.payload.len() as u64 != self.length {
            return Err(ReplicationError::MalformedRecord(format!(
                "sequence {}: payload is {} bytes, header says {}",
                self.sequence,
                self.payload.len(),
                self.length
            )));
        }
        Ok(())
    }
}

/// A sealed, recoverable point in a pair's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub pair_id: PairId,
    pub rp_id: RpId,
    pub kind: RpKind,
    /// Highest change sequence reflected in this point.
    pub sequence_watermark: u64,
    pub created_at: DateTime<Utc>,
    /// Bytes held in this point's own delta.
    pub size: u64,
    pub predecessor_rp_id: Option<RpId>,
    /// Source volume size at the time this point was sealed.
    pub volume_size: u64,
}

/// A source → target replication relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPair {
    pub pair_id: PairId,
    pub source_volume_ref: String,
    pub target_volume_ref: String,
    pub state: PairState,
    pub health: Health,
    /// Last change sequence durably acknowledged on the target.
    pub current_sequence: u64,
    /// Milliseconds since the newest durable RP while changes are outstanding.
    pub lag_ms: u64,
    pub policy: RetentionPolicy,
    /// Most recent failure, cleared when the pair returns to `OK`.
    pub last_failure: Option<FailureReport>,
    /// State to return to if an in-flight resync fails.
    pub resync_origin: Option<PairState>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationPair {
    pub fn new(
        source_volume_ref: impl Into<String>,
        target_volume_ref: impl Into<String>,
        policy: RetentionPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            pair_id: PairId::generate(),
            source_volume_ref: source_volume_ref.into(),
            target_volume_ref: target_volume_ref.into(),
            state: PairState::Uninitialized,
            health: Health::Ok,
            current_sequence: 0,
            lag_ms: 0,
            policy,
            last_failure: None,
            resync_origin: None,
            suspended_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One persisted entry of a pair's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub pair_id: PairId,
    /// Command or internal event that caused the transition.
    pub trigger: String,
    pub from_state: PairState,
    pub to_state: PairState,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// What a recovery request should reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTarget {
    /// Newest retained recovery point.
    Latest,
    /// A specific recovery point.
    Rp(RpId),
    /// Newest recovery point created at or before the instant.
    PointInTime(DateTime<Utc>),
    /// Newest application-consistent point created at or before the instant.
    AppConsistentAt(DateTime<Utc>),
}

impl fmt::Display for RecoveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTarget::Latest => f.write_str("latest"),
            RecoveryTarget::Rp(id) => write!(f, "{}", id),
            RecoveryTarget::PointInTime(t) => write!(f, "time:{}", t.to_rfc3339()),
            RecoveryTarget::AppConsistentAt(t) => write!(f, "acrp:{}", t.to_rfc3339()),
        }
    }
}

impl FromStr for RecoveryTarget {
    type Err = ReplicationError;

    /// Accepts `latest`, a decimal rp id, `time:<rfc3339>` or `acrp:<rfc3339>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(RecoveryTarget::Latest);
        }
        let parse_time = |t: &str| {
            DateTime::parse_from_rfc3339(t)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ReplicationError::Config(format!("invalid recovery time {:?}: {}", t, e)))
        };
        if let Some(t) = s.strip_prefix("time:") {
            return parse_time(t).map(RecoveryTarget::PointInTime);
        }
        if let Some(t) = s.strip_prefix("acrp:") {
            return parse_time(t).map(RecoveryTarget::AppConsistentAt);
        }
        s.parse::<RpId>()
            .map(RecoveryTarget::Rp)
            .map_err(|_| ReplicationError::Config(format!("invalid recovery target {:?}", s)))
    }
}
