// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable metadata for pairs and their recovery point chains.
//!
//! Everything the core must not lose across a crash lives in one SQLite
//! database:
//!
//! | Table | Key | Holds |
//! |-------|-----|-------|
//! | `pairs` | `pair_id` | pair metadata, state, health, policy |
//! | `pair_events` | autoincrement | transition log, written with the state change |
//! | `recovery_points` | `(pair_id, rp_id)` | chain metadata, `predecessor_rp_id` foreign key |
//! | `rp_extents` | `(pair_id, rp_id, offset)` | each RP's delta |
//! | `change_ledger` | `(pair_id, sequence)` | acknowledged but not yet sealed changes |
//! | `seed_progress` / `seed_extents` | `pair_id` | baseline checkpoint |
//!
//! # Atomicity
//!
//! Each multi-row mutation runs in a single transaction:
//!
//! ```text
//! save_pair       pair row + transition event
//! seal_rp         RP row + delta + ledger truncation (+ seed clear)
//! commit_merge    successor rewrite + merged RP marked
//! release_merged  merged RP row + delta removed
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY / SQLITE_LOCKED are retried with exponential backoff (10ms
//! doubling to 500ms, 5 attempts). Whole transactions are retried, never
//! individual statements inside one.

use crate::config::StoreConfig;
use crate::coordinator::PairState;
use crate::error::{FailureReport, ReplicationError, Result};
use crate::extent::ExtentMap;
use crate::model::{ChangeRecord, Health, PairId, RecoveryPoint, ReplicationPair, RpId, RpKind, TransitionRecord};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pairs (
        pair_id TEXT PRIMARY KEY,
        source_ref TEXT NOT NULL,
        target_ref TEXT NOT NULL,
        state TEXT NOT NULL,
        health TEXT NOT NULL,
        current_sequence INTEGER NOT NULL,
        lag_ms INTEGER NOT NULL,
        policy TEXT NOT NULL,
        last_failure TEXT,
        resync_origin TEXT,
        suspended_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pair_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pair_id TEXT NOT NULL,
        trigger_name TEXT NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        detail TEXT,
        at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS recovery_points (
        pair_id TEXT NOT NULL,
        rp_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        sequence_watermark INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        size INTEGER NOT NULL,
        predecessor_rp_id INTEGER,
        volume_size INTEGER NOT NULL,
        absorbed_rp_id INTEGER,
        merged_into INTEGER,
        PRIMARY KEY (pair_id, rp_id),
        FOREIGN KEY (pair_id, predecessor_rp_id)
            REFERENCES recovery_points (pair_id, rp_id)
            DEFERRABLE INITIALLY DEFERRED
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rp_extents (
        pair_id TEXT NOT NULL,
        rp_id INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (pair_id, rp_id, byte_offset)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_ledger (
        pair_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        length INTEGER NOT NULL,
        payload BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (pair_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS seed_progress (
        pair_id TEXT PRIMARY KEY,
        start_sequence INTEGER NOT NULL,
        next_offset INTEGER NOT NULL,
        volume_size INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS seed_extents (
        pair_id TEXT NOT NULL,
        byte_offset INTEGER NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (pair_id, byte_offset)
    )
    "#,
];

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::Internal(format!("corrupt {} row: {}", what, e))
}

/// A recovery point as persisted, with merge bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredRecoveryPoint {
    pub rp: RecoveryPoint,
    pub delta: ExtentMap,
    /// Last RP folded into this one by a merge commit.
    pub absorbed_rp_id: Option<RpId>,
    /// Set once this RP has been folded into a successor; the row is
    /// awaiting release.
    pub merged_into: Option<RpId>,
}

/// Baseline transfer checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedCheckpoint {
    pub pair_id: PairId,
    /// Source sequence captured before the first block was read.
    pub start_sequence: u64,
    /// First byte not yet copied.
    pub next_offset: u64,
    pub volume_size: u64,
}

type PairRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    i64,
    i64,
);

type RpRow = (i64, String, i64, i64, i64, Option<i64>, i64, Option<i64>, Option<i64>);

/// SQLite-backed metadata store.
pub struct MetadataStore {
    pool: SqlitePool,
    path: String,
    wal_mode: bool,
}

impl MetadataStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let in_memory = path == ":memory:";
        info!(path = %path, "Opening metadata store");

        let (options, pool_options) = if in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            // One long-lived connection keeps the in-memory database alive.
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let mut options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_millis(250))
                .create_if_missing(true);
            if config.wal_mode {
                options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
            }
            (options, SqlitePoolOptions::new().max_connections(4))
        };

        let pool = pool_options
            .connect_with(options.foreign_keys(true))
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            path,
            wal_mode: config.wal_mode && !in_memory,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pairs
    // ─────────────────────────────────────────────────────────────────────

    /// Persist the pair row and, when given, its transition event in one
    /// transaction.
    pub async fn save_pair(&self, pair: &ReplicationPair, event: Option<&TransitionRecord>) -> Result<()> {
        let policy = serde_json::to_string(&pair.policy)
            .map_err(|e| ReplicationError::Internal(format!("policy encode: {}", e)))?;
        let last_failure = pair
            .last_failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ReplicationError::Internal(format!("failure encode: {}", e)))?;

        let pool = &self.pool;
        let policy = &policy;
        let last_failure = &last_failure;

        execute_with_retry("save_pair", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO pairs (pair_id, source_ref, target_ref, state, health, current_sequence,
                                   lag_ms, policy, last_failure, resync_origin, suspended_at,
                                   created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(pair_id) DO UPDATE SET
                    state = excluded.state,
                    health = excluded.health,
                    current_sequence = excluded.current_sequence,
                    lag_ms = excluded.lag_ms,
                    policy = excluded.policy,
                    last_failure = excluded.last_failure,
                    resync_origin = excluded.resync_origin,
                    suspended_at = excluded.suspended_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(pair.pair_id.as_str())
            .bind(&pair.source_volume_ref)
            .bind(&pair.target_volume_ref)
            .bind(pair.state.as_str())
            .bind(pair.health.as_str())
            .bind(pair.current_sequence as i64)
            .bind(pair.lag_ms as i64)
            .bind(policy)
            .bind(last_failure.as_deref())
            .bind(pair.resync_origin.map(|s| s.as_str()))
            .bind(pair.suspended_at.map(to_millis))
            .bind(to_millis(pair.created_at))
            .bind(to_millis(pair.updated_at))
            .execute(&mut *tx)
            .await?;

            if let Some(event) = event {
                sqlx::query(
                    "INSERT INTO pair_events (pair_id, trigger_name, from_state, to_state, detail, at)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(event.pair_id.as_str())
                .bind(&event.trigger)
                .bind(event.from_state.as_str())
                .bind(event.to_state.as_str())
                .bind(event.detail.as_deref())
                .bind(to_millis(event.at))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Load every persisted pair, including deleted ones.
    pub async fn load_pairs(&self) -> Result<Vec<ReplicationPair>> {
        let pool = &self.pool;
        let rows: Vec<PairRow> = execute_with_retry("load_pairs", || async move {
            sqlx::query_as(
                "SELECT pair_id, source_ref, target_ref, state, health, current_sequence, lag_ms,
                        policy, last_failure, resync_origin, suspended_at, created_at, updated_at
                 FROM pairs ORDER BY created_at",
            )
            .fetch_all(pool)
            .await
        })
        .await?;

        rows.into_iter().map(pair_from_row).collect()
    }

    /// Transition log for a pair, oldest first.
    pub async fn pair_events(&self, pair_id: &PairId) -> Result<Vec<TransitionRecord>> {
        let pool = &self.pool;
        let rows: Vec<(String, String, String, Option<String>, i64)> =
            execute_with_retry("pair_events", || async move {
                sqlx::query_as(
                    "SELECT trigger_name, from_state, to_state, detail, at
                     FROM pair_events WHERE pair_id = ? ORDER BY id",
                )
                .bind(pair_id.as_str())
                .fetch_all(pool)
                .await
            })
            .await?;

        rows.into_iter()
            .map(|(trigger, from, to, detail, at)| {
                Ok(TransitionRecord {
                    pair_id: pair_id.clone(),
                    trigger,
                    from_state: from.parse()?,
                    to_state: to.parse()?,
                    detail,
                    at: from_millis(at),
                })
            })
            .collect()
    }

    /// Remove every recovery point, ledger entry and seed checkpoint of a
    /// pair. The pair row and its event log are kept.
    pub async fn purge_pair(&self, pair_id: &PairId) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("purge_pair", || async move {
            let mut tx = pool.begin().await?;
            for table in ["rp_extents", "recovery_points", "change_ledger", "seed_extents", "seed_progress"] {
                sqlx::query(&format!("DELETE FROM {} WHERE pair_id = ?", table))
                    .bind(pair_id.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await?;
        info!(pair_id = %pair_id, "Purged pair data");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Change ledger
    // ─────────────────────────────────────────────────────────────────────

    /// Durably record acknowledged changes. Existing `(pair_id, sequence)`
    /// rows are left untouched.
    pub async fn append_ledger(&self, records: &[ChangeRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("append_ledger", || async move {
            let mut tx = pool.begin().await?;
            for record in records {
                sqlx::query(
                    "INSERT OR IGNORE INTO change_ledger (pair_id, sequence, byte_offset, length, payload, timestamp)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(record.pair_id.as_str())
                .bind(record.sequence as i64)
                .bind(record.offset as i64)
                .bind(record.length as i64)
                .bind(&record.payload)
                .bind(to_millis(record.timestamp))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Unsealed ledger entries for a pair in sequence order.
    pub async fn load_ledger(&self, pair_id: &PairId) -> Result<Vec<ChangeRecord>> {
        let pool = &self.pool;
        let rows: Vec<(i64, i64, i64, Vec<u8>, i64)> = execute_with_retry("load_ledger", || async move {
            sqlx::query_as(
                "SELECT sequence, byte_offset, length, payload, timestamp
                 FROM change_ledger WHERE pair_id = ? ORDER BY sequence",
            )
            .bind(pair_id.as_str())
            .fetch_all(pool)
            .await
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sequence, offset, length, payload, ts)| ChangeRecord {
                pair_id: pair_id.clone(),
                sequence: sequence as u64,
                offset: offset as u64,
                length: length as u64,
                payload,
                timestamp: from_millis(ts),
            })
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recovery point chain
    // ─────────────────────────────────────────────────────────────────────

    /// Seal a new RP: insert it with its delta and truncate the ledger up to
    /// its watermark. With `clear_seed`, also drop any seed checkpoint.
    pub async fn seal_rp(&self, rp: &RecoveryPoint, delta: &ExtentMap, clear_seed: bool) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("seal_rp", || async move {
            let mut tx = pool.begin().await?;
            insert_rp(&mut tx, rp, delta).await?;
            if clear_seed {
                clear_seed_in(&mut tx, &rp.pair_id).await?;
            }
            tx.commit().await
        })
        .await?;

        debug!(
            pair_id = %rp.pair_id,
            rp_id = rp.rp_id,
            watermark = rp.sequence_watermark,
            "Recovery point sealed"
        );
        Ok(())
    }

    /// Replace a pair's whole chain, merged-but-unreleased entries included,
    /// with a single base RP holding `image`.
    pub async fn rebase_chain(&self, rp: &RecoveryPoint, image: &ExtentMap) -> Result<()> {
        let pool = &self.pool;
        let retired: u64 = execute_with_retry("rebase_chain", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM rp_extents WHERE pair_id = ?")
                .bind(rp.pair_id.as_str())
                .execute(&mut *tx)
                .await?;
            let retired = sqlx::query("DELETE FROM recovery_points WHERE pair_id = ?")
                .bind(rp.pair_id.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
            insert_rp(&mut tx, rp, image).await?;
            clear_seed_in(&mut tx, &rp.pair_id).await?;
            tx.commit().await?;
            Ok(retired)
        })
        .await?;

        warn!(
            pair_id = %rp.pair_id,
            rp_id = rp.rp_id,
            retired,
            watermark = rp.sequence_watermark,
            "Recovery point chain rebased"
        );
        Ok(())
    }

    /// Replace an existing RP's delta in place (resync with no new source
    /// sequence) and drop any seed checkpoint.
    pub async fn rewrite_rp_delta(&self, pair_id: &PairId, rp_id: RpId, delta: &ExtentMap) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("rewrite_rp_delta", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM rp_extents WHERE pair_id = ? AND rp_id = ?")
                .bind(pair_id.as_str())
                .bind(rp_id as i64)
                .execute(&mut *tx)
                .await?;
            write_extents(&mut tx, pair_id, rp_id, delta).await?;
            sqlx::query("UPDATE recovery_points SET size = ? WHERE pair_id = ? AND rp_id = ?")
                .bind(delta.bytes() as i64)
                .bind(pair_id.as_str())
                .bind(rp_id as i64)
                .execute(&mut *tx)
                .await?;
            clear_seed_in(&mut tx, pair_id).await?;
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Load a pair's chain (including merged-but-unreleased RPs) ordered by id.
    pub async fn load_chain(&self, pair_id: &PairId) -> Result<Vec<StoredRecoveryPoint>> {
        let pool = &self.pool;
        let rows: Vec<RpRow> = execute_with_retry("load_chain", || async move {
            sqlx::query_as(
                "SELECT rp_id, kind, sequence_watermark, created_at, size, predecessor_rp_id,
                        volume_size, absorbed_rp_id, merged_into
                 FROM recovery_points WHERE pair_id = ? ORDER BY rp_id",
            )
            .bind(pair_id.as_str())
            .fetch_all(pool)
            .await
        })
        .await?;

        let extents: Vec<(i64, i64, Vec<u8>)> = execute_with_retry("load_chain_extents", || async move {
            sqlx::query_as("SELECT rp_id, byte_offset, data FROM rp_extents WHERE pair_id = ? ORDER BY rp_id, byte_offset")
                .bind(pair_id.as_str())
                .fetch_all(pool)
                .await
        })
        .await?;

        let mut deltas: std::collections::HashMap<i64, ExtentMap> = std::collections::HashMap::new();
        for (rp_id, offset, data) in extents {
            deltas.entry(rp_id).or_default().write(offset as u64, &data);
        }

        rows.into_iter()
            .map(|(rp_id, kind, watermark, created_at, size, pred, volume_size, absorbed, merged_into)| {
                Ok(StoredRecoveryPoint {
                    rp: RecoveryPoint {
                        pair_id: pair_id.clone(),
                        rp_id: rp_id as u64,
                        kind: RpKind::from_str(&kind).map_err(|e| corrupt("recovery_points", e))?,
                        sequence_watermark: watermark as u64,
                        created_at: from_millis(created_at),
                        size: size as u64,
                        predecessor_rp_id: pred.map(|p| p as u64),
                        volume_size: volume_size as u64,
                    },
                    delta: deltas.remove(&rp_id).unwrap_or_default(),
                    absorbed_rp_id: absorbed.map(|a| a as u64),
                    merged_into: merged_into.map(|m| m as u64),
                })
            })
            .collect()
    }

    /// Commit phase of a merge.
    ///
    /// Rewrites `successor_rp_id` to hold `delta` and to point at
    /// `new_predecessor`, and marks `merged_rp_id` as folded into it. Returns
    /// `false` without writing anything if the persisted chain no longer
    /// matches the plan. A merge that was already committed returns `true`.
    pub async fn commit_merge(
        &self,
        pair_id: &PairId,
        merged_rp_id: RpId,
        successor_rp_id: RpId,
        new_predecessor: Option<RpId>,
        delta: &ExtentMap,
    ) -> Result<bool> {
        let pool = &self.pool;
        let committed = execute_with_retry("commit_merge", || async move {
            let mut tx = pool.begin().await?;

            let successor: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
                "SELECT predecessor_rp_id, absorbed_rp_id FROM recovery_points WHERE pair_id = ? AND rp_id = ?",
            )
            .bind(pair_id.as_str())
            .bind(successor_rp_id as i64)
            .fetch_optional(&mut *tx)
            .await?;

            let merged: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
                "SELECT predecessor_rp_id, merged_into FROM recovery_points WHERE pair_id = ? AND rp_id = ?",
            )
            .bind(pair_id.as_str())
            .bind(merged_rp_id as i64)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((succ_pred, succ_absorbed)) = successor else {
                return Ok(false);
            };
            if succ_pred != Some(merged_rp_id as i64) {
                let already = succ_absorbed == Some(merged_rp_id as i64)
                    && merged.map_or(true, |(_, into)| into == Some(successor_rp_id as i64));
                return Ok(already);
            }
            let Some((merged_pred, merged_into)) = merged else {
                return Ok(false);
            };
            if merged_into.is_some() || merged_pred.map(|p| p as u64) != new_predecessor {
                return Ok(false);
            }

            sqlx::query(
                "UPDATE recovery_points SET predecessor_rp_id = ?, absorbed_rp_id = ?, size = ?
                 WHERE pair_id = ? AND rp_id = ?",
            )
            .bind(new_predecessor.map(|p| p as i64))
            .bind(merged_rp_id as i64)
            .bind(delta.bytes() as i64)
            .bind(pair_id.as_str())
            .bind(successor_rp_id as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM rp_extents WHERE pair_id = ? AND rp_id = ?")
                .bind(pair_id.as_str())
                .bind(successor_rp_id as i64)
                .execute(&mut *tx)
                .await?;
            write_extents(&mut tx, pair_id, successor_rp_id, delta).await?;

            sqlx::query("UPDATE recovery_points SET merged_into = ? WHERE pair_id = ? AND rp_id = ?")
                .bind(successor_rp_id as i64)
                .bind(pair_id.as_str())
                .bind(merged_rp_id as i64)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(true)
        })
        .await?;
        Ok(committed)
    }

    /// Release phase of a merge: drop an RP that was folded into its
    /// successor. Idempotent; RPs not marked as merged are never touched.
    pub async fn release_merged(&self, pair_id: &PairId, rp_id: RpId) -> Result<bool> {
        let pool = &self.pool;
        let released = execute_with_retry("release_merged", || async move {
            let mut tx = pool.begin().await?;
            let done = sqlx::query(
                "DELETE FROM recovery_points WHERE pair_id = ? AND rp_id = ? AND merged_into IS NOT NULL",
            )
            .bind(pair_id.as_str())
            .bind(rp_id as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if done > 0 {
                sqlx::query("DELETE FROM rp_extents WHERE pair_id = ? AND rp_id = ?")
                    .bind(pair_id.as_str())
                    .bind(rp_id as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(done > 0)
        })
        .await?;
        Ok(released)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Seed checkpoints
    // ─────────────────────────────────────────────────────────────────────

    /// Persist one copied chunk together with the advanced checkpoint.
    pub async fn save_seed_progress(&self, checkpoint: &SeedCheckpoint, chunk: Option<(u64, &[u8])>) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("save_seed_progress", || async move {
            let mut tx = pool.begin().await?;
            if let Some((offset, data)) = chunk {
                sqlx::query("INSERT OR REPLACE INTO seed_extents (pair_id, byte_offset, data) VALUES (?, ?, ?)")
                    .bind(checkpoint.pair_id.as_str())
                    .bind(offset as i64)
                    .bind(data)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query(
                r#"
                INSERT INTO seed_progress (pair_id, start_sequence, next_offset, volume_size, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(pair_id) DO UPDATE SET
                    start_sequence = excluded.start_sequence,
                    next_offset = excluded.next_offset,
                    volume_size = excluded.volume_size,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(checkpoint.pair_id.as_str())
            .bind(checkpoint.start_sequence as i64)
            .bind(checkpoint.next_offset as i64)
            .bind(checkpoint.volume_size as i64)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Load a pair's seed checkpoint and the chunks copied so far.
    pub async fn load_seed(&self, pair_id: &PairId) -> Result<Option<(SeedCheckpoint, ExtentMap)>> {
        let pool = &self.pool;
        let progress: Option<(i64, i64, i64)> = execute_with_retry("load_seed", || async move {
            sqlx::query_as("SELECT start_sequence, next_offset, volume_size FROM seed_progress WHERE pair_id = ?")
                .bind(pair_id.as_str())
                .fetch_optional(pool)
                .await
        })
        .await?;

        let Some((start_sequence, next_offset, volume_size)) = progress else {
            return Ok(None);
        };

        let chunks: Vec<(i64, Vec<u8>)> = execute_with_retry("load_seed_extents", || async move {
            sqlx::query_as("SELECT byte_offset, data FROM seed_extents WHERE pair_id = ? ORDER BY byte_offset")
                .bind(pair_id.as_str())
                .fetch_all(pool)
                .await
        })
        .await?;

        let extents = chunks.into_iter().map(|(o, d)| (o as u64, d)).collect();
        Ok(Some((
            SeedCheckpoint {
                pair_id: pair_id.clone(),
                start_sequence: start_sequence as u64,
                next_offset: next_offset as u64,
                volume_size: volume_size as u64,
            },
            extents,
        )))
    }

    /// Drop a pair's seed checkpoint.
    pub async fn clear_seed(&self, pair_id: &PairId) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("clear_seed", || async move {
            let mut tx = pool.begin().await?;
            clear_seed_in(&mut tx, pair_id).await?;
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Metadata store closed");
    }
}

/// Insert `rp` with its delta and truncate the ledger up to its watermark.
async fn insert_rp(
    conn: &mut SqliteConnection,
    rp: &RecoveryPoint,
    delta: &ExtentMap,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO recovery_points (pair_id, rp_id, kind, sequence_watermark, created_at, size,
                                      predecessor_rp_id, volume_size, absorbed_rp_id, merged_into)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)",
    )
    .bind(rp.pair_id.as_str())
    .bind(rp.rp_id as i64)
    .bind(rp.kind.as_str())
    .bind(rp.sequence_watermark as i64)
    .bind(to_millis(rp.created_at))
    .bind(rp.size as i64)
    .bind(rp.predecessor_rp_id.map(|id| id as i64))
    .bind(rp.volume_size as i64)
    .execute(&mut *conn)
    .await?;

    write_extents(&mut *conn, &rp.pair_id, rp.rp_id, delta).await?;

    sqlx::query("DELETE FROM change_ledger WHERE pair_id = ? AND sequence <= ?")
        .bind(rp.pair_id.as_str())
        .bind(rp.sequence_watermark as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_extents(
    conn: &mut SqliteConnection,
    pair_id: &PairId,
    rp_id: RpId,
    delta: &ExtentMap,
) -> std::result::Result<(), sqlx::Error> {
    for (offset, data) in delta.iter() {
        sqlx::query("INSERT INTO rp_extents (pair_id, rp_id, byte_offset, data) VALUES (?, ?, ?, ?)")
            .bind(pair_id.as_str())
            .bind(rp_id as i64)
            .bind(offset as i64)
            .bind(data)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn clear_seed_in(conn: &mut SqliteConnection, pair_id: &PairId) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM seed_extents WHERE pair_id = ?")
        .bind(pair_id.as_str())
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM seed_progress WHERE pair_id = ?")
        .bind(pair_id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn pair_from_row(row: PairRow) -> Result<ReplicationPair> {
    let (
        pair_id,
        source_ref,
        target_ref,
        state,
        health,
        current_sequence,
        lag_ms,
        policy,
        last_failure,
        resync_origin,
        suspended_at,
        created_at,
        updated_at,
    ) = row;

    let last_failure: Option<FailureReport> = last_failure
        .map(|f| serde_json::from_str(&f))
        .transpose()
        .map_err(|e| corrupt("pairs.last_failure", e))?;

    Ok(ReplicationPair {
        pair_id: PairId::from(pair_id),
        source_volume_ref: source_ref,
        target_volume_ref: target_ref,
        state: PairState::from_str(&state)?,
        health: Health::from_str(&health)?,
        current_sequence: current_sequence as u64,
        lag_ms: lag_ms as u64,
        policy: serde_json::from_str(&policy).map_err(|e| corrupt("pairs.policy", e))?,
        last_failure,
        resync_origin: resync_origin.map(|s| PairState::from_str(&s)).transpose()?,
        suspended_at: suspended_at.map(from_millis),
        created_at: from_millis(created_at),
        updated_at: from_millis(updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionPolicy;
    use tempfile::tempdir;

    fn rp(pair: &PairId, id: RpId, watermark: u64, pred: Option<RpId>, delta: &ExtentMap) -> RecoveryPoint {
        RecoveryPoint {
            pair_id: pair.clone(),
            rp_id: id,
            kind: RpKind::Ccrp,
            sequence_watermark: watermark,
            created_at: Utc::now(),
            size: delta.bytes(),
            predecessor_rp_id: pred,
            volume_size: 64,
        }
    }

    fn record(pair: &PairId, sequence: u64) -> ChangeRecord {
        ChangeRecord {
            pair_id: pair.clone(),
            sequence,
            offset: sequence * 4,
            length: 4,
            payload: vec![sequence as u8; 4],
            timestamp: Utc::now(),
        }
    }

    async fn memory_store() -> MetadataStore {
        MetadataStore::open(&StoreConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_pair_roundtrip_with_event() {
        let store = memory_store().await;
        let mut pair = ReplicationPair::new("src-a", "tgt-a", RetentionPolicy::default());
        store.save_pair(&pair, None).await.unwrap();

        pair.state = PairState::Syncing;
        pair.last_failure = Some(ReplicationError::Cancelled.report(&pair.pair_id, 0));
        let event = TransitionRecord {
            pair_id: pair.pair_id.clone(),
            trigger: "start".into(),
            from_state: PairState::Uninitialized,
            to_state: PairState::Syncing,
            detail: None,
            at: Utc::now(),
        };
        store.save_pair(&pair, Some(&event)).await.unwrap();

        let loaded = store.load_pairs().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, PairState::Syncing);
        assert_eq!(loaded[0].policy, pair.policy);
        assert_eq!(loaded[0].last_failure.as_ref().map(|f| f.kind.as_str()), Some("cancelled"));

        let events = store.pair_events(&pair.pair_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_state, PairState::Syncing);
    }

    #[tokio::test]
    async fn test_ledger_dedups_and_truncates_on_seal() {
        let store = memory_store().await;
        let pair = PairId::from("p");

        store.append_ledger(&[record(&pair, 1), record(&pair, 2)]).await.unwrap();
        store.append_ledger(&[record(&pair, 2), record(&pair, 3)]).await.unwrap();
        assert_eq!(store.load_ledger(&pair).await.unwrap().len(), 3);

        let mut delta = ExtentMap::new();
        delta.write(4, &[1; 4]);
        store.seal_rp(&rp(&pair, 1, 2, None, &delta), &delta, false).await.unwrap();

        let ledger = store.load_ledger(&pair).await.unwrap();
        assert_eq!(ledger.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_chain_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join("meta.db").to_string_lossy().to_string(),
            wal_mode: true,
        };
        let pair = PairId::from("p");

        {
            let store = MetadataStore::open(&config).await.unwrap();
            let mut d1 = ExtentMap::new();
            d1.write(0, &[1; 8]);
            let mut d2 = ExtentMap::new();
            d2.write(4, &[2; 2]);
            store.seal_rp(&rp(&pair, 1, 5, None, &d1), &d1, false).await.unwrap();
            store.seal_rp(&rp(&pair, 2, 9, Some(1), &d2), &d2, false).await.unwrap();
            store.close().await;
        }

        let store = MetadataStore::open(&config).await.unwrap();
        let chain = store.load_chain(&pair).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].rp.predecessor_rp_id, Some(1));
        assert_eq!(chain[1].delta.bytes(), 2);
        assert_eq!(chain[0].delta.bytes(), 8);
        store.close().await;
    }

    #[tokio::test]
    async fn test_merge_commit_then_release() {
        let store = memory_store().await;
        let pair = PairId::from("p");
        let mut d1 = ExtentMap::new();
        d1.write(0, &[1; 4]);
        let mut d2 = ExtentMap::new();
        d2.write(2, &[2; 4]);
        store.seal_rp(&rp(&pair, 1, 1, None, &d1), &d1, false).await.unwrap();
        store.seal_rp(&rp(&pair, 2, 2, Some(1), &d2), &d2, false).await.unwrap();

        let merged = ExtentMap::merged(&d1, &d2);
        assert!(store.commit_merge(&pair, 1, 2, None, &merged).await.unwrap());
        // Re-committing the same plan is recognised as done.
        assert!(store.commit_merge(&pair, 1, 2, None, &merged).await.unwrap());

        let chain = store.load_chain(&pair).await.unwrap();
        assert_eq!(chain[0].merged_into, Some(2));
        assert_eq!(chain[1].rp.predecessor_rp_id, None);
        assert_eq!(chain[1].absorbed_rp_id, Some(1));

        assert!(store.release_merged(&pair, 1).await.unwrap());
        assert!(!store.release_merged(&pair, 1).await.unwrap());
        let chain = store.load_chain(&pair).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].delta, merged);
    }

    #[tokio::test]
    async fn test_merge_conflict_on_stale_plan() {
        let store = memory_store().await;
        let pair = PairId::from("p");
        let d = ExtentMap::new();
        store.seal_rp(&rp(&pair, 1, 1, None, &d), &d, false).await.unwrap();
        store.seal_rp(&rp(&pair, 2, 2, Some(1), &d), &d, false).await.unwrap();
        store.seal_rp(&rp(&pair, 3, 3, Some(2), &d), &d, false).await.unwrap();

        // rp 3's predecessor is 2, not 1
        assert!(!store.commit_merge(&pair, 1, 3, None, &d).await.unwrap());
        // wrong new predecessor
        assert!(!store.commit_merge(&pair, 2, 3, None, &d).await.unwrap());
        // release never touches an unmerged RP
        assert!(!store.release_merged(&pair, 2).await.unwrap());
        assert_eq!(store.load_chain(&pair).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_seed_checkpoint_cleared_by_seal() {
        let store = memory_store().await;
        let pair = PairId::from("p");
        let checkpoint = SeedCheckpoint {
            pair_id: pair.clone(),
            start_sequence: 7,
            next_offset: 4,
            volume_size: 8,
        };
        store.save_seed_progress(&checkpoint, Some((0, &[9; 4]))).await.unwrap();

        let (loaded, extents) = store.load_seed(&pair).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(extents.bytes(), 4);

        let d = ExtentMap::new();
        store.seal_rp(&rp(&pair, 1, 7, None, &d), &d, true).await.unwrap();
        assert!(store.load_seed(&pair).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_pair_keeps_events() {
        let store = memory_store().await;
        let pair = ReplicationPair::new("s", "t", RetentionPolicy::default());
        let event = TransitionRecord {
            pair_id: pair.pair_id.clone(),
            trigger: "stop".into(),
            from_state: PairState::Replicating,
            to_state: PairState::Stopped,
            detail: None,
            at: Utc::now(),
        };
        store.save_pair(&pair, Some(&event)).await.unwrap();
        store.append_ledger(&[record(&pair.pair_id, 1)]).await.unwrap();
        let d = ExtentMap::new();
        store.seal_rp(&rp(&pair.pair_id, 1, 1, None, &d), &d, false).await.unwrap();

        store.purge_pair(&pair.pair_id).await.unwrap();
        assert!(store.load_chain(&pair.pair_id).await.unwrap().is_empty());
        assert!(store.load_ledger(&pair.pair_id).await.unwrap().is_empty());
        assert_eq!(store.pair_events(&pair.pair_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_pool_timed_out() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
    }
}
