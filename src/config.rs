// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication core.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Durations are human-readable strings (`"5m"`, `"2days"`, `"250ms"`) parsed
//! with `humantime`.
//!
//! # Quick Start
//!
//! ```rust
//! use volume_replication::config::{EngineConfig, RetentionPolicy};
//!
//! let config = EngineConfig {
//!     default_policy: RetentionPolicy {
//!         retention: "3days".into(),
//!         ..Default::default()
//!     },
//!     ..EngineConfig::for_testing()
//! };
//! assert!(config.default_policy.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── settings: EngineSettings
//! │   ├── delivery: DeliveryConfig     # change stream fetch/ingest loop
//! │   ├── health: HealthConfig         # per-pair monitor cadence
//! │   ├── sweep: SweepConfig           # retention & merge background sweep
//! │   ├── seed: SeedConfig             # baseline / resync block transfer
//! │   └── admission: AdmissionConfig   # target capacity arbitration
//! ├── default_policy: RetentionPolicy  # applied when a pair brings none
//! └── store: StoreConfig               # SQLite metadata persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! settings:
//!   delivery:
//!     batch_size: 512
//!     poll_interval: "100ms"
//!   sweep:
//!     interval: "10m"
//!
//! default_policy:
//!   retention: "7days"
//!   merge_enabled: true
//!   merge_delay: "2days"
//!   max_rp_interval: "6h"
//!   max_rp_offline: "15m"
//!   off_peak_only: true
//!   peak_schedule:
//!     Monday: [9, 10, 11, 12, 13, 14, 15, 16, 17]
//!   ccrp_interval: "5m"
//!   acrp_interval: "1h"
//!
//! store:
//!   sqlite_path: "/var/lib/replication/meta.db"
//! ```

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn check_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| ReplicationError::Config(format!("{}: invalid duration {:?}: {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Tunables for the data path, monitors and background sweeps.
    #[serde(default)]
    pub settings: EngineSettings,

    /// Retention policy for pairs created without one.
    #[serde(default)]
    pub default_policy: RetentionPolicy,

    /// Metadata persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Create a config with an in-memory store and fast cadences for tests.
    pub fn for_testing() -> Self {
        Self {
            settings: EngineSettings::for_testing(),
            default_policy: RetentionPolicy::for_testing(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.settings.delivery.validate()?;
        self.settings.seed.validate()?;
        check_duration("health.check_interval", &self.settings.health.check_interval)?;
        check_duration("health.quiesce_timeout", &self.settings.health.quiesce_timeout)?;
        check_duration("sweep.interval", &self.settings.sweep.interval)?;
        check_duration("admission.queue_timeout", &self.settings.admission.queue_timeout)?;
        self.default_policy.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineSettings {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub seed: SeedConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl EngineSettings {
    pub fn for_testing() -> Self {
        Self {
            delivery: DeliveryConfig {
                poll_interval: "10ms".to_string(),
                backoff_base: "10ms".to_string(),
                backoff_max: "100ms".to_string(),
                ..Default::default()
            },
            health: HealthConfig {
                check_interval: "20ms".to_string(),
                quiesce_timeout: "200ms".to_string(),
            },
            sweep: SweepConfig {
                interval: "50ms".to_string(),
                ..Default::default()
            },
            seed: SeedConfig {
                block_size: 4096,
                chunk_blocks: 4,
                ..Default::default()
            },
            admission: AdmissionConfig {
                safety_margin_bytes: 0,
                queue_timeout: "200ms".to_string(),
                poll_interval: "10ms".to_string(),
                max_concurrent_seeds: 4,
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryConfig: change stream fetch → ingest loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Live delivery (transport fetch → RPS ingest) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum change records per fetch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle wait between fetches when the source has nothing new.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// First retry delay after a transport failure.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    /// Ceiling for the exponential retry delay.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    /// Consecutive credential refresh failures before the pair is marked `Broken`.
    #[serde(default = "default_auth_refresh_attempts")]
    pub auth_refresh_attempts: u32,

    /// Number of consecutive failures before the fetch circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open before probing again (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_batch_size() -> usize {
    256
}

fn default_poll_interval() -> String {
    "200ms".to_string()
}

fn default_backoff_base() -> String {
    "100ms".to_string()
}

fn default_backoff_max() -> String {
    "30s".to_string()
}

fn default_auth_refresh_attempts() -> u32 {
    3
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval: "200ms".to_string(),
            backoff_base: "100ms".to_string(),
            backoff_max: "30s".to_string(),
            auth_refresh_attempts: 3,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 30,
        }
    }
}

impl DeliveryConfig {
    /// Parse the poll interval, falling back to 200ms.
    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_millis(200))
    }

    /// Retry schedule for transport failures on the live path.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: parse_or(&self.backoff_base, Duration::from_millis(100)),
            max_delay: parse_or(&self.backoff_max, Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }

    /// Circuit breaker settings for transport fetches.
    pub fn circuit_config(&self) -> crate::circuit_breaker::CircuitConfig {
        crate::circuit_breaker::CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(self.circuit_reset_timeout_sec),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::Config("delivery.batch_size must be > 0".into()));
        }
        check_duration("delivery.poll_interval", &self.poll_interval)?;
        check_duration("delivery.backoff_base", &self.backoff_base)?;
        check_duration("delivery.backoff_max", &self.backoff_max)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HealthConfig / SweepConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-pair health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often each pair re-evaluates lag, outage and pending ACRPs.
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    /// Longest wait for the application-consistency handshake before the
    /// ACRP interval is skipped.
    #[serde(default = "default_quiesce_timeout")]
    pub quiesce_timeout: String,
}

fn default_check_interval() -> String {
    "1s".to_string()
}

fn default_quiesce_timeout() -> String {
    "30s".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            quiesce_timeout: default_quiesce_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval_duration(&self) -> Duration {
        parse_or(&self.check_interval, Duration::from_secs(1))
    }

    pub fn quiesce_timeout_duration(&self) -> Duration {
        parse_or(&self.quiesce_timeout, Duration::from_secs(30))
    }
}

/// Retention & merge sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Whether the background sweep runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often every pair's chain is swept.
    #[serde(default = "default_sweep_interval")]
    pub interval: String,

    /// Upper bound on merge/prune steps per pair per sweep.
    /// Remaining work carries over to the next sweep.
    #[serde(default = "default_max_steps_per_pair")]
    pub max_steps_per_pair: usize,

    /// How many times a conflicting merge step is re-planned before giving up.
    #[serde(default = "default_merge_conflict_retries")]
    pub merge_conflict_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_sweep_interval() -> String {
    "1m".to_string()
}

fn default_max_steps_per_pair() -> usize {
    64
}

fn default_merge_conflict_retries() -> u32 {
    3
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_sweep_interval(),
            max_steps_per_pair: 64,
            merge_conflict_retries: 3,
        }
    }
}

impl SweepConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SeedConfig: baseline and resync block transfer
// ═══════════════════════════════════════════════════════════════════════════════

/// Baseline / resync transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Block granularity for checksum comparison (bytes).
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Blocks copied per checkpointed chunk.
    #[serde(default = "default_chunk_blocks")]
    pub chunk_blocks: u64,

    /// Largest sequence gap a delta resync will replay.
    /// Beyond this, resync falls back to a block-level re-seed.
    #[serde(default = "default_catch_up_threshold")]
    pub catch_up_threshold: u64,

    /// Rounds of buffered-delta replay before the watermark swap.
    #[serde(default = "default_max_catch_up_rounds")]
    pub max_catch_up_rounds: u32,

    /// Attempts per block read before the seed fails.
    #[serde(default = "default_fetch_retry_attempts")]
    pub fetch_retry_attempts: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (keep seeds from starving live replication)
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable chunk rate limiting for seed transfers.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained chunks per second across all seeds.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst allowance in chunks.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_block_size() -> u64 {
    64 * 1024
}

fn default_chunk_blocks() -> u64 {
    16
}

fn default_catch_up_threshold() -> u64 {
    100_000
}

fn default_max_catch_up_rounds() -> u32 {
    16
}

fn default_fetch_retry_attempts() -> usize {
    5
}

fn default_rate_limit_per_sec() -> u32 {
    64
}

fn default_rate_limit_burst() -> u32 {
    16
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            chunk_blocks: 16,
            catch_up_threshold: 100_000,
            max_catch_up_rounds: 16,
            fetch_retry_attempts: 5,
            rate_limit_enabled: false,
            rate_limit_per_sec: 64,
            rate_limit_burst: 16,
        }
    }
}

impl SeedConfig {
    /// Bytes copied per checkpointed chunk.
    pub fn chunk_bytes(&self) -> u64 {
        self.block_size.saturating_mul(self.chunk_blocks.max(1))
    }

    /// Create rate limit configuration from seed settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(ReplicationError::Config("seed.block_size must be > 0".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AdmissionConfig: shared target capacity
// ═══════════════════════════════════════════════════════════════════════════════

/// Target capacity admission control for seed transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Headroom always kept free on the target (bytes).
    #[serde(default = "default_safety_margin_bytes")]
    pub safety_margin_bytes: u64,

    /// How long a seed may queue for capacity before failing.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: String,

    /// How often a queued seed re-checks headroom.
    #[serde(default = "default_admission_poll")]
    pub poll_interval: String,

    /// Concurrent seed transfers across all pairs.
    #[serde(default = "default_max_concurrent_seeds")]
    pub max_concurrent_seeds: usize,
}

fn default_safety_margin_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_queue_timeout() -> String {
    "5m".to_string()
}

fn default_admission_poll() -> String {
    "1s".to_string()
}

fn default_max_concurrent_seeds() -> usize {
    4
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            safety_margin_bytes: default_safety_margin_bytes(),
            queue_timeout: default_queue_timeout(),
            poll_interval: default_admission_poll(),
            max_concurrent_seeds: 4,
        }
    }
}

impl AdmissionConfig {
    pub fn queue_timeout_duration(&self) -> Duration {
        parse_or(&self.queue_timeout, Duration::from_secs(300))
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetentionPolicy: attached per pair
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-pair retention, merge and recovery point cadence policy.
///
/// Read-only once attached to a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Recovery points older than this are pruned.
    #[serde(default = "default_retention")]
    pub retention: String,

    /// Whether aged recovery points are merged into their successor.
    #[serde(default = "default_true")]
    pub merge_enabled: bool,

    /// Age after which a recovery point becomes merge-eligible.
    #[serde(default = "default_merge_delay")]
    pub merge_delay: String,

    /// Longest tolerated gap between durable recovery points before health degrades.
    #[serde(default = "default_max_rp_interval")]
    pub max_rp_interval: String,

    /// Longest tolerated disconnect before a resync is forced.
    #[serde(default = "default_max_rp_offline")]
    pub max_rp_offline: String,

    /// Only prune and merge outside peak hours.
    #[serde(default = "default_false")]
    pub off_peak_only: bool,

    /// Peak hours per weekday, used when `off_peak_only` is set.
    #[serde(default)]
    pub peak_schedule: PeakSchedule,

    /// Crash-consistent recovery point cadence.
    #[serde(default = "default_ccrp_interval")]
    pub ccrp_interval: Option<String>,

    /// Application-consistent recovery point cadence.
    #[serde(default = "default_acrp_interval")]
    pub acrp_interval: Option<String>,
}

fn default_retention() -> String {
    "7days".to_string()
}

fn default_merge_delay() -> String {
    "2days".to_string()
}

fn default_max_rp_interval() -> String {
    "6h".to_string()
}

fn default_max_rp_offline() -> String {
    "15m".to_string()
}

fn default_ccrp_interval() -> Option<String> {
    Some("5m".to_string())
}

fn default_acrp_interval() -> Option<String> {
    Some("1h".to_string())
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            merge_enabled: true,
            merge_delay: default_merge_delay(),
            max_rp_interval: default_max_rp_interval(),
            max_rp_offline: default_max_rp_offline(),
            off_peak_only: false,
            peak_schedule: PeakSchedule::default(),
            ccrp_interval: default_ccrp_interval(),
            acrp_interval: default_acrp_interval(),
        }
    }
}

impl RetentionPolicy {
    /// Fast cadences with merge effectively disabled, for tests.
    pub fn for_testing() -> Self {
        Self {
            retention: "365days".to_string(),
            merge_enabled: false,
            merge_delay: "365days".to_string(),
            max_rp_interval: "10s".to_string(),
            max_rp_offline: "10s".to_string(),
            off_peak_only: false,
            peak_schedule: PeakSchedule::default(),
            ccrp_interval: Some("100ms".to_string()),
            acrp_interval: None,
        }
    }

    /// Reject unparseable durations and policies with no recovery point cadence.
    pub fn validate(&self) -> Result<()> {
        check_duration("retention", &self.retention)?;
        check_duration("merge_delay", &self.merge_delay)?;
        check_duration("max_rp_interval", &self.max_rp_interval)?;
        check_duration("max_rp_offline", &self.max_rp_offline)?;
        if let Some(ccrp) = &self.ccrp_interval {
            check_duration("ccrp_interval", ccrp)?;
        }
        if let Some(acrp) = &self.acrp_interval {
            check_duration("acrp_interval", acrp)?;
        }
        if self.ccrp_interval.is_none() && self.acrp_interval.is_none() {
            return Err(ReplicationError::Config(
                "at least one of ccrp_interval / acrp_interval must be set".into(),
            ));
        }
        self.peak_schedule.validate()
    }

    pub fn retention_duration(&self) -> Duration {
        parse_or(&self.retention, Duration::from_secs(7 * 86_400))
    }

    pub fn merge_delay_duration(&self) -> Duration {
        parse_or(&self.merge_delay, Duration::from_secs(2 * 86_400))
    }

    pub fn max_rp_interval_duration(&self) -> Duration {
        parse_or(&self.max_rp_interval, Duration::from_secs(6 * 3600))
    }

    pub fn max_rp_offline_duration(&self) -> Duration {
        parse_or(&self.max_rp_offline, Duration::from_secs(15 * 60))
    }

    pub fn ccrp_interval_duration(&self) -> Option<Duration> {
        self.ccrp_interval
            .as_deref()
            .map(|s| parse_or(s, Duration::from_secs(300)))
    }

    pub fn acrp_interval_duration(&self) -> Option<Duration> {
        self.acrp_interval
            .as_deref()
            .map(|s| parse_or(s, Duration::from_secs(3600)))
    }

    /// Whether prune/merge may run at `now`.
    pub fn maintenance_allowed(&self, now: DateTime<Utc>) -> bool {
        !self.off_peak_only || !self.peak_schedule.is_peak(now)
    }
}

/// Weekly peak-hour schedule (UTC).
///
/// Keys are English weekday names (`"Monday"` .. `"Sunday"`), values the
/// peak hours of that day (0-23). Days not listed have no peak hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PeakSchedule(pub BTreeMap<String, Vec<u8>>);

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

impl PeakSchedule {
    /// The same peak hours on every weekday.
    pub fn every_day(hours: impl IntoIterator<Item = u8> + Clone) -> Self {
        Self(
            WEEKDAYS
                .iter()
                .map(|d| (d.to_string(), hours.clone().into_iter().collect()))
                .collect(),
        )
    }

    /// Check whether `at` falls inside a peak hour.
    pub fn is_peak(&self, at: DateTime<Utc>) -> bool {
        let day = WEEKDAYS[at.weekday().num_days_from_monday() as usize];
        let hour = at.hour() as u8;
        self.0.get(day).is_some_and(|hours| hours.contains(&hour))
    }

    fn validate(&self) -> Result<()> {
        for (day, hours) in &self.0 {
            if !WEEKDAYS.contains(&day.as_str()) {
                return Err(ReplicationError::Config(format!("peak_schedule: unknown day {:?}", day)));
            }
            if let Some(h) = hours.iter().find(|h| **h > 23) {
                return Err(ReplicationError::Config(format!("peak_schedule: hour {} out of range", h)));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: metadata persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata store configuration.
///
/// Pair metadata, the recovery point chain and the change ledger live in
/// SQLite so they survive process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_meta.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_retention_policy_defaults() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.retention_duration(), Duration::from_secs(7 * 86_400));
        assert!(policy.merge_enabled);
        assert_eq!(policy.merge_delay_duration(), Duration::from_secs(2 * 86_400));
        assert_eq!(policy.max_rp_interval_duration(), Duration::from_secs(6 * 3600));
        assert_eq!(policy.max_rp_offline_duration(), Duration::from_secs(15 * 60));
        assert!(!policy.off_peak_only);
        assert_eq!(policy.ccrp_interval_duration(), Some(Duration::from_secs(300)));
        assert_eq!(policy.acrp_interval_duration(), Some(Duration::from_secs(3600)));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_requires_a_cadence() {
        let policy = RetentionPolicy {
            ccrp_interval: None,
            acrp_interval: None,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(ReplicationError::Config(_))));

        let acrp_only = RetentionPolicy {
            ccrp_interval: None,
            ..Default::default()
        };
        assert!(acrp_only.validate().is_ok());
    }

    #[test]
    fn test_policy_rejects_bad_duration() {
        let policy = RetentionPolicy {
            merge_delay: "soon".to_string(),
            ..Default::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("merge_delay"));
    }

    #[test]
    fn test_duration_formats() {
        let test_cases = [
            ("5m", Duration::from_secs(300)),
            ("2days", Duration::from_secs(172_800)),
            ("250ms", Duration::from_millis(250)),
            ("1h 30m", Duration::from_secs(5400)),
        ];

        for (input, expected) in test_cases {
            let policy = RetentionPolicy {
                max_rp_offline: input.to_string(),
                ..Default::default()
            };
            assert_eq!(policy.max_rp_offline_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = DeliveryConfig {
            poll_interval: "invalid".to_string(),
            ..Default::default()
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(200));
    }

    #[test]
    fn test_peak_schedule_lookup() {
        let mut days = BTreeMap::new();
        days.insert("Monday".to_string(), vec![9, 10, 11]);
        let schedule = PeakSchedule(days);

        // 2024-01-01 is a Monday
        let monday_10 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let monday_12 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let tuesday_10 = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();

        assert!(schedule.is_peak(monday_10));
        assert!(!schedule.is_peak(monday_12));
        assert!(!schedule.is_peak(tuesday_10));
    }

    #[test]
    fn test_off_peak_gating() {
        let monday_10 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let mut policy = RetentionPolicy {
            peak_schedule: PeakSchedule::every_day(9..=17),
            ..Default::default()
        };
        assert!(policy.maintenance_allowed(monday_10));

        policy.off_peak_only = true;
        assert!(!policy.maintenance_allowed(monday_10));
        let monday_20 = Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap();
        assert!(policy.maintenance_allowed(monday_20));
    }

    #[test]
    fn test_peak_schedule_validation() {
        let mut days = BTreeMap::new();
        days.insert("Funday".to_string(), vec![1]);
        let policy = RetentionPolicy {
            peak_schedule: PeakSchedule(days),
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let mut days = BTreeMap::new();
        days.insert("Friday".to_string(), vec![24]);
        let policy = RetentionPolicy {
            peak_schedule: PeakSchedule(days),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_seed_rate_limit_config() {
        let mut config = SeedConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 10;
        config.rate_limit_burst = 2;

        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 10);
        assert_eq!(rate.burst_size, 2);
    }

    #[test]
    fn test_seed_chunk_bytes() {
        let config = SeedConfig {
            block_size: 4096,
            chunk_blocks: 4,
            ..Default::default()
        };
        assert_eq!(config.chunk_bytes(), 16_384);
    }

    #[test]
    fn test_delivery_retry_config() {
        let config = DeliveryConfig::default();
        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert_eq!(retry.max_attempts, usize::MAX);
    }

    #[test]
    fn test_store_config_in_memory() {
        let config = StoreConfig::in_memory();
        assert_eq!(config.sqlite_path, ":memory:");
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_for_testing_config_validates() {
        let config = EngineConfig::for_testing();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.sqlite_path, ":memory:");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = EngineConfig::default();
        config.default_policy.off_peak_only = true;
        config.default_policy.peak_schedule = PeakSchedule::every_day([8u8, 9]);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.default_policy, config.default_policy);
        assert_eq!(parsed.settings.delivery.batch_size, 256);
        assert_eq!(parsed.store.sqlite_path, "replication_meta.db");
    }

    #[test]
    fn test_policy_partial_json_uses_defaults() {
        let json = r#"{ "retention": "3days", "peak_schedule": { "Sunday": [1, 2] } }"#;
        let policy: RetentionPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.retention_duration(), Duration::from_secs(3 * 86_400));
        assert!(policy.merge_enabled);
        assert_eq!(policy.ccrp_interval.as_deref(), Some("5m"));
        assert_eq!(policy.peak_schedule.0.get("Sunday"), Some(&vec![1, 2]));
    }
}
