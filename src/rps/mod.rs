// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recovery Point Store.
//!
//! Turns each pair's ordered change stream into durable recovery points.
//!
//! # Ingest
//!
//! ```text
//! record ──► dedup (pair_id, sequence) ──► change ledger (SQLite) ──► ack
//!                                                │
//!                                   acked_through = highest contiguous sequence
//! ```
//!
//! Redelivered records are acknowledged again without touching state.
//! Records that arrive ahead of a gap are kept durable but do not advance
//! `acked_through`, so a seal never covers a sequence that is still in flight.
//!
//! # Seal
//!
//! `materialize_rp` folds every unsealed record up to `acked_through` into a
//! delta, and persists the new RP, its delta and the ledger truncation in one
//! transaction. An interval with nothing new seals nothing.
//!
//! # Isolation
//!
//! Readers clone an `Arc<RpChain>` snapshot and reconstruct from it without
//! holding any lock. Writers (seal, merge step, resync install) serialize on
//! a per-pair mutex and publish a fresh snapshot when done, so recovery never
//! blocks, nor is blocked by, replication.

pub mod chain;

pub use chain::{ChainEntry, RpChain};

use crate::error::{ReplicationError, Result};
use crate::extent::{ExtentMap, VolumeImage};
use crate::model::{ChangeRecord, PairId, RecoveryPoint, RecoveryTarget, RpId, RpKind};
use crate::store::MetadataStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of an ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Highest contiguous sequence durably held for the pair.
    pub acked_through: u64,
    pub applied: usize,
    pub duplicates: usize,
}

#[derive(Debug, Default)]
struct IngestState {
    acked_through: u64,
    sealed_watermark: u64,
    /// Durable but not yet sealed, keyed by sequence.
    unsealed: BTreeMap<u64, ChangeRecord>,
}

impl IngestState {
    fn advance(&mut self) {
        while self.unsealed.contains_key(&(self.acked_through + 1)) {
            self.acked_through += 1;
        }
    }

    /// Overlay records in `(after, through]` in sequence order.
    fn delta(&self, after: u64, through: u64) -> ExtentMap {
        let mut delta = ExtentMap::new();
        if through > after {
            for record in self.unsealed.range(after + 1..=through).map(|(_, r)| r) {
                delta.write(record.offset, &record.payload);
            }
        }
        delta
    }

    /// Forget everything at or below `watermark`.
    fn retire(&mut self, watermark: u64) {
        self.unsealed = self.unsealed.split_off(&(watermark + 1));
        self.sealed_watermark = watermark;
        self.acked_through = self.acked_through.max(watermark);
        self.advance();
    }
}

struct PairRps {
    pair_id: PairId,
    chain: RwLock<Arc<RpChain>>,
    ingest: Mutex<IngestState>,
    acked: AtomicU64,
    /// Held for one chain mutation at a time.
    writer: Mutex<()>,
}

impl PairRps {
    fn new(pair_id: PairId, chain: RpChain, state: IngestState) -> Self {
        let acked = AtomicU64::new(state.acked_through);
        Self {
            pair_id,
            chain: RwLock::new(Arc::new(chain)),
            ingest: Mutex::new(state),
            acked,
            writer: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<RpChain> {
        Arc::clone(&self.chain.read())
    }

    fn publish(&self, chain: RpChain) {
        crate::metrics::set_chain_length(self.pair_id.as_str(), chain.len());
        *self.chain.write() = Arc::new(chain);
    }
}

/// Per-pair recovery point namespaces over the metadata store.
pub struct RecoveryPointStore {
    store: Arc<MetadataStore>,
    pairs: RwLock<HashMap<PairId, Arc<PairRps>>>,
}

impl RecoveryPointStore {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            pairs: RwLock::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    fn pair(&self, pair_id: &PairId) -> Result<Arc<PairRps>> {
        self.pairs
            .read()
            .get(pair_id)
            .cloned()
            .ok_or_else(|| ReplicationError::PairNotFound(pair_id.to_string()))
    }

    /// Open an empty namespace for a new pair.
    pub fn register_pair(&self, pair_id: &PairId) {
        self.pairs
            .write()
            .entry(pair_id.clone())
            .or_insert_with(|| Arc::new(PairRps::new(pair_id.clone(), RpChain::new(), IngestState::default())));
    }

    /// Rebuild a pair's namespace from the store after a restart.
    pub async fn load_pair(&self, pair_id: &PairId) -> Result<()> {
        let chain: RpChain = self
            .store
            .load_chain(pair_id)
            .await?
            .into_iter()
            .map(|stored| ChainEntry {
                rp: stored.rp,
                delta: Arc::new(stored.delta),
                absorbed_rp_id: stored.absorbed_rp_id,
                merged_into: stored.merged_into,
            })
            .collect();

        let sealed = chain.latest().map(|e| e.rp.sequence_watermark).unwrap_or(0);
        let mut state = IngestState {
            acked_through: sealed,
            sealed_watermark: sealed,
            unsealed: BTreeMap::new(),
        };
        for record in self.store.load_ledger(pair_id).await? {
            if record.sequence > sealed {
                state.unsealed.insert(record.sequence, record);
            }
        }
        state.advance();

        info!(
            pair_id = %pair_id,
            recovery_points = chain.len(),
            pending_releases = chain.pending_releases().len(),
            sealed_watermark = sealed,
            acked_through = state.acked_through,
            "Recovery point namespace loaded"
        );
        crate::metrics::set_chain_length(pair_id.as_str(), chain.len());
        self.pairs
            .write()
            .insert(pair_id.clone(), Arc::new(PairRps::new(pair_id.clone(), chain, state)));
        Ok(())
    }

    /// Tear down a pair's namespace and everything persisted under it.
    pub async fn drop_pair(&self, pair_id: &PairId) -> Result<()> {
        let rps = self.pairs.write().remove(pair_id);
        let _guard = match &rps {
            Some(rps) => Some(rps.writer.lock().await),
            None => None,
        };
        self.store.purge_pair(pair_id).await?;
        crate::metrics::set_chain_length(pair_id.as_str(), 0);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingest
    // ─────────────────────────────────────────────────────────────────────

    /// Ingest one change record. Idempotent by `(pair_id, sequence)`.
    pub async fn ingest(&self, record: ChangeRecord) -> Result<Ack> {
        let pair_id = record.pair_id.clone();
        self.ingest_batch(&pair_id, vec![record]).await
    }

    /// Ingest a batch of records for one pair with a single durable write.
    ///
    /// Records that write past the volume size of the latest RP are rejected.
    pub async fn ingest_batch(&self, pair_id: &PairId, records: Vec<ChangeRecord>) -> Result<Ack> {
        let rps = self.pair(pair_id)?;
        let volume_size = rps.snapshot().latest().map(|e| e.rp.volume_size);
        for record in &records {
            if &record.pair_id != pair_id {
                return Err(ReplicationError::MalformedRecord(format!(
                    "record for pair {} delivered to {}",
                    record.pair_id, pair_id
                )));
            }
            record.validate()?;
            if let (Some(size), Some(end)) = (volume_size, record.end()) {
                if end > size {
                    return Err(ReplicationError::MalformedRecord(format!(
                        "sequence {}: write ends at {}, volume is {} bytes",
                        record.sequence, end, size
                    )));
                }
            }
        }

        let mut state = rps.ingest.lock().await;
        let total = records.len();
        let mut fresh: Vec<ChangeRecord> = Vec::with_capacity(total);
        for record in records {
            let seen = record.sequence <= state.acked_through
                || state.unsealed.contains_key(&record.sequence)
                || fresh.iter().any(|r| r.sequence == record.sequence);
            if !seen {
                fresh.push(record);
            }
        }
        let applied = fresh.len();

        if applied > 0 {
            self.store.append_ledger(&fresh).await?;
            for record in fresh {
                state.unsealed.insert(record.sequence, record);
            }
            state.advance();
            rps.acked.store(state.acked_through, Ordering::Release);
        }

        crate::metrics::record_changes_ingested(pair_id.as_str(), applied, total - applied);
        debug!(pair_id = %pair_id, applied, duplicates = total - applied, acked_through = state.acked_through, "Ingested");
        Ok(Ack {
            acked_through: state.acked_through,
            applied,
            duplicates: total - applied,
        })
    }

    /// Highest contiguous sequence durably held.
    pub fn acked_through(&self, pair_id: &PairId) -> Result<u64> {
        Ok(self.pair(pair_id)?.acked.load(Ordering::Acquire))
    }

    /// Watermark of the newest retained RP (0 if none).
    pub fn sealed_watermark(&self, pair_id: &PairId) -> Result<u64> {
        Ok(self
            .pair(pair_id)?
            .snapshot()
            .latest()
            .map(|e| e.rp.sequence_watermark)
            .unwrap_or(0))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Seal
    // ─────────────────────────────────────────────────────────────────────

    /// Seal everything acknowledged so far into a new RP.
    pub async fn materialize_rp(&self, pair_id: &PairId, kind: RpKind) -> Result<Option<RecoveryPoint>> {
        self.materialize_rp_at(pair_id, kind, None).await
    }

    /// Seal records up to `watermark` (default: everything acknowledged).
    ///
    /// Returns `None` when there is nothing new at or below the watermark, or
    /// when the watermark has not been fully acknowledged yet.
    pub async fn materialize_rp_at(
        &self,
        pair_id: &PairId,
        kind: RpKind,
        watermark: Option<u64>,
    ) -> Result<Option<RecoveryPoint>> {
        let rps = self.pair(pair_id)?;
        let _writer = rps.writer.lock().await;

        let chain = rps.snapshot();
        let Some(latest) = chain.latest() else {
            return Err(ReplicationError::InvalidState {
                expected: "baseline recovery point".into(),
                actual: "empty chain".into(),
            });
        };

        let (watermark, delta) = {
            let state = rps.ingest.lock().await;
            let target = watermark.unwrap_or(state.acked_through);
            if target > state.acked_through || target <= state.sealed_watermark {
                return Ok(None);
            }
            (target, state.delta(state.sealed_watermark, target))
        };

        let rp = RecoveryPoint {
            pair_id: pair_id.clone(),
            rp_id: chain.next_id(),
            kind,
            sequence_watermark: watermark,
            created_at: not_before(latest.rp.created_at),
            size: delta.bytes(),
            predecessor_rp_id: Some(latest.rp.rp_id),
            volume_size: latest.rp.volume_size,
        };
        self.store.seal_rp(&rp, &delta, false).await?;

        let mut next = (*chain).clone();
        next.insert(ChainEntry {
            rp: rp.clone(),
            delta: Arc::new(delta),
            absorbed_rp_id: None,
            merged_into: None,
        });
        rps.publish(next);
        rps.ingest.lock().await.retire(watermark);

        crate::metrics::record_rp_sealed(pair_id.as_str(), kind.as_str(), rp.size);
        info!(pair_id = %pair_id, rp_id = rp.rp_id, kind = %kind, watermark, size = rp.size, "Recovery point sealed");
        Ok(Some(rp))
    }

    /// Install a completed baseline as the pair's first RP.
    pub async fn install_baseline(
        &self,
        pair_id: &PairId,
        image: ExtentMap,
        watermark: u64,
        volume_size: u64,
    ) -> Result<RecoveryPoint> {
        let rps = self.pair(pair_id)?;
        let _writer = rps.writer.lock().await;
        let chain = rps.snapshot();
        if !chain.is_empty() {
            return Err(ReplicationError::InvalidState {
                expected: "empty chain".into(),
                actual: format!("{} recovery points", chain.len()),
            });
        }

        let mut state = rps.ingest.lock().await;
        let rp = RecoveryPoint {
            pair_id: pair_id.clone(),
            rp_id: chain.next_id(),
            kind: RpKind::Ccrp,
            sequence_watermark: watermark,
            created_at: Utc::now(),
            size: image.bytes(),
            predecessor_rp_id: None,
            volume_size,
        };
        self.store.seal_rp(&rp, &image, true).await?;

        let mut next = (*chain).clone();
        next.insert(ChainEntry {
            rp: rp.clone(),
            delta: Arc::new(image),
            absorbed_rp_id: None,
            merged_into: None,
        });
        rps.publish(next);
        state.retire(watermark);
        rps.acked.store(state.acked_through, Ordering::Release);

        crate::metrics::record_rp_sealed(pair_id.as_str(), rp.kind.as_str(), rp.size);
        info!(pair_id = %pair_id, rp_id = rp.rp_id, watermark, size = rp.size, "Baseline recovery point installed");
        Ok(rp)
    }

    /// Atomically fold a completed resync into the chain.
    ///
    /// `staged` holds the blocks and replayed changes the resync delivered,
    /// current as of `watermark`. Unsealed acknowledged records are laid down
    /// first, `staged` on top. If the watermark moved, a new RP is sealed; if
    /// it did not but the target diverged, the latest RP's delta is corrected
    /// in place. Either way `acked_through` jumps to `watermark` in the same
    /// step.
    pub async fn install_resync(
        &self,
        pair_id: &PairId,
        staged: ExtentMap,
        watermark: u64,
    ) -> Result<Option<RecoveryPoint>> {
        let rps = self.pair(pair_id)?;
        let _writer = rps.writer.lock().await;
        let chain = rps.snapshot();
        let Some(latest) = chain.latest() else {
            return Err(ReplicationError::InvalidState {
                expected: "baseline recovery point".into(),
                actual: "empty chain".into(),
            });
        };

        let mut state = rps.ingest.lock().await;
        if watermark < latest.rp.sequence_watermark {
            return Err(ReplicationError::InvalidState {
                expected: format!("source sequence >= {}", latest.rp.sequence_watermark),
                actual: watermark.to_string(),
            });
        }
        let mut delta = state.delta(state.sealed_watermark, state.acked_through.min(watermark));
        delta.overlay(&staged);

        let mut next = (*chain).clone();
        let sealed = if watermark > latest.rp.sequence_watermark {
            let rp = RecoveryPoint {
                pair_id: pair_id.clone(),
                rp_id: chain.next_id(),
                kind: RpKind::Ccrp,
                sequence_watermark: watermark,
                created_at: not_before(latest.rp.created_at),
                size: delta.bytes(),
                predecessor_rp_id: Some(latest.rp.rp_id),
                volume_size: latest.rp.volume_size,
            };
            self.store.seal_rp(&rp, &delta, true).await?;
            next.insert(ChainEntry {
                rp: rp.clone(),
                delta: Arc::new(delta),
                absorbed_rp_id: None,
                merged_into: None,
            });
            crate::metrics::record_rp_sealed(pair_id.as_str(), rp.kind.as_str(), rp.size);
            Some(rp)
        } else if !delta.is_empty() {
            let latest_id = latest.rp.rp_id;
            let corrected = ExtentMap::merged(&latest.delta, &delta);
            self.store.rewrite_rp_delta(pair_id, latest_id, &corrected).await?;
            if let Some(entry) = next.get_mut(latest_id) {
                entry.rp.size = corrected.bytes();
                entry.delta = Arc::new(corrected);
            }
            warn!(pair_id = %pair_id, rp_id = latest_id, "Target diverged at unchanged watermark, latest recovery point corrected");
            None
        } else {
            self.store.clear_seed(pair_id).await?;
            None
        };

        rps.publish(next);
        state.retire(watermark);
        rps.acked.store(state.acked_through, Ordering::Release);
        info!(pair_id = %pair_id, watermark, sealed = sealed.is_some(), "Resync installed");
        Ok(sealed)
    }

    /// Replace the whole chain with a fresh base RP holding `image`.
    ///
    /// Used to repair a chain that failed verification: nothing in the old
    /// chain is read. The new base keeps counting ids past the old chain so
    /// a retired id is never reused.
    pub async fn install_rebase(
        &self,
        pair_id: &PairId,
        image: ExtentMap,
        watermark: u64,
        volume_size: u64,
    ) -> Result<RecoveryPoint> {
        let rps = self.pair(pair_id)?;
        let _writer = rps.writer.lock().await;
        let chain = rps.snapshot();

        let mut state = rps.ingest.lock().await;
        let created_at = chain
            .latest()
            .map(|e| not_before(e.rp.created_at))
            .unwrap_or_else(Utc::now);
        let rp = RecoveryPoint {
            pair_id: pair_id.clone(),
            rp_id: chain.next_id(),
            kind: RpKind::Ccrp,
            sequence_watermark: watermark,
            created_at,
            size: image.bytes(),
            predecessor_rp_id: None,
            volume_size,
        };
        self.store.rebase_chain(&rp, &image).await?;

        let mut next = RpChain::new();
        next.insert(ChainEntry {
            rp: rp.clone(),
            delta: Arc::new(image),
            absorbed_rp_id: None,
            merged_into: None,
        });
        rps.publish(next);
        state.retire(watermark);
        rps.acked.store(state.acked_through, Ordering::Release);

        crate::metrics::record_rp_sealed(pair_id.as_str(), rp.kind.as_str(), rp.size);
        info!(pair_id = %pair_id, rp_id = rp.rp_id, watermark, retired = chain.len(), "Chain rebased onto a fresh base");
        Ok(rp)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read side
    // ─────────────────────────────────────────────────────────────────────

    /// Retained RPs ordered by creation.
    pub fn list(&self, pair_id: &PairId) -> Result<Vec<RecoveryPoint>> {
        Ok(self.pair(pair_id)?.snapshot().recovery_points())
    }

    /// Current chain snapshot.
    pub fn chain(&self, pair_id: &PairId) -> Result<Arc<RpChain>> {
        Ok(self.pair(pair_id)?.snapshot())
    }

    pub fn latest(&self, pair_id: &PairId) -> Result<Option<RecoveryPoint>> {
        Ok(self.pair(pair_id)?.snapshot().latest().map(|e| e.rp.clone()))
    }

    pub fn resolve(&self, pair_id: &PairId, target: &RecoveryTarget) -> Result<RecoveryPoint> {
        self.pair(pair_id)?
            .snapshot()
            .resolve(target)
            .map(|e| e.rp.clone())
            .ok_or_else(|| ReplicationError::RecoveryPointNotFound {
                pair_id: pair_id.to_string(),
                target: target.to_string(),
            })
    }

    /// Reconstruct the target volume as of `target`.
    ///
    /// Works on a snapshot: never blocks ingestion and never changes state.
    pub fn recover_to(&self, pair_id: &PairId, target: &RecoveryTarget) -> Result<(RecoveryPoint, VolumeImage)> {
        let started = Instant::now();
        let chain = self.pair(pair_id)?.snapshot();
        let entry = chain
            .resolve(target)
            .ok_or_else(|| ReplicationError::RecoveryPointNotFound {
                pair_id: pair_id.to_string(),
                target: target.to_string(),
            })?;
        let (extents, depth) = chain.reconstruct(pair_id, entry.rp.rp_id)?;
        crate::metrics::record_recovery(pair_id.as_str(), depth, started.elapsed());
        Ok((entry.rp.clone(), VolumeImage::new(entry.rp.volume_size, extents)))
    }

    /// Latest RP plus every acknowledged-but-unsealed record: what the target
    /// currently holds.
    pub async fn current_image(&self, pair_id: &PairId) -> Result<VolumeImage> {
        let rps = self.pair(pair_id)?;
        let chain = rps.snapshot();
        let Some(latest) = chain.latest() else {
            return Ok(VolumeImage::new(0, ExtentMap::new()));
        };
        let (mut extents, _) = chain.reconstruct(pair_id, latest.rp.rp_id)?;
        let state = rps.ingest.lock().await;
        extents.overlay(&state.delta(latest.rp.sequence_watermark, state.acked_through));
        Ok(VolumeImage::new(latest.rp.volume_size, extents))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Merge mechanics
    // ─────────────────────────────────────────────────────────────────────

    /// Commit phase: fold `merged_rp_id` into its immediate successor.
    ///
    /// Fails with `MergeConflict` if the chain no longer matches the plan.
    pub async fn commit_merge(&self, pair_id: &PairId, merged_rp_id: RpId, successor_rp_id: RpId) -> Result<RecoveryPoint> {
        let rps = self.pair(pair_id)?;
        let _writer = rps.writer.lock().await;
        let chain = rps.snapshot();
        let conflict = || ReplicationError::MergeConflict {
            pair_id: pair_id.to_string(),
            rp_id: merged_rp_id,
        };

        let merged = chain.get(merged_rp_id).filter(|e| e.is_live()).ok_or_else(conflict)?;
        let successor = chain
            .get(successor_rp_id)
            .filter(|e| e.is_live() && e.rp.predecessor_rp_id == Some(merged_rp_id))
            .ok_or_else(conflict)?;

        let delta = ExtentMap::merged(&merged.delta, &successor.delta);
        let new_predecessor = merged.rp.predecessor_rp_id;
        if !self
            .store
            .commit_merge(pair_id, merged_rp_id, successor_rp_id, new_predecessor, &delta)
            .await?
        {
            return Err(conflict());
        }

        let mut next = (*chain).clone();
        if let Some(entry) = next.get_mut(successor_rp_id) {
            entry.rp.predecessor_rp_id = new_predecessor;
            entry.rp.size = delta.bytes();
            entry.delta = Arc::new(delta);
            entry.absorbed_rp_id = Some(merged_rp_id);
        }
        if let Some(entry) = next.get_mut(merged_rp_id) {
            entry.merged_into = Some(successor_rp_id);
        }
        let successor = next.get(successor_rp_id).map(|e| e.rp.clone()).ok_or_else(conflict)?;
        rps.publish(next);
        debug!(pair_id = %pair_id, merged = merged_rp_id, into = successor_rp_id, "Merge committed");
        Ok(successor)
    }

    /// Release phase: drop a merged RP. Idempotent.
    pub async fn release_merged(&self, pair_id: &PairId, rp_id: RpId) -> Result<()> {
        let rps = self.pair(pair_id)?;
        let _writer = rps.writer.lock().await;
        let chain = rps.snapshot();
        if chain.get(rp_id).is_some_and(|e| e.is_live()) {
            return Err(ReplicationError::InvalidState {
                expected: format!("rp {} merged", rp_id),
                actual: "live".into(),
            });
        }
        self.store.release_merged(pair_id, rp_id).await?;
        if chain.get(rp_id).is_some() {
            let mut next = (*chain).clone();
            next.remove(rp_id);
            rps.publish(next);
        }
        debug!(pair_id = %pair_id, rp_id, "Merged recovery point released");
        Ok(())
    }

    /// Merged RPs whose release has not happened yet.
    pub fn pending_releases(&self, pair_id: &PairId) -> Result<Vec<RpId>> {
        Ok(self.pair(pair_id)?.snapshot().pending_releases())
    }

    /// Linkage integrity scan over the current snapshot.
    pub fn verify(&self, pair_id: &PairId) -> Result<()> {
        self.pair(pair_id)?.snapshot().verify(pair_id)
    }
}

/// `now`, but never earlier than `floor`.
fn not_before(floor: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    async fn rps_with_pair() -> (RecoveryPointStore, PairId) {
        let store = Arc::new(MetadataStore::open(&StoreConfig::in_memory()).await.unwrap());
        let rps = RecoveryPointStore::new(store);
        let pair = PairId::from("p");
        rps.register_pair(&pair);
        (rps, pair)
    }

    fn record(pair: &PairId, sequence: u64, offset: u64, byte: u8) -> ChangeRecord {
        ChangeRecord {
            pair_id: pair.clone(),
            sequence,
            offset,
            length: 2,
            payload: vec![byte; 2],
            timestamp: Utc::now(),
        }
    }

    async fn baseline(rps: &RecoveryPointStore, pair: &PairId) -> RecoveryPoint {
        let mut image = ExtentMap::new();
        image.write(0, &[0xAA; 16]);
        rps.install_baseline(pair, image, 0, 16).await.unwrap()
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;

        let first = rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        assert_eq!(first, Ack { acked_through: 1, applied: 1, duplicates: 0 });
        let again = rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        assert_eq!(again, Ack { acked_through: 1, applied: 0, duplicates: 1 });
    }

    #[tokio::test]
    async fn test_ingest_rejects_unaddressable_writes() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;

        // Past the 16-byte volume.
        assert!(matches!(
            rps.ingest(record(&pair, 1, 15, 1)).await,
            Err(ReplicationError::MalformedRecord(_))
        ));
        // Past the end of the address space.
        assert!(matches!(
            rps.ingest(record(&pair, 1, u64::MAX - 1, 1)).await,
            Err(ReplicationError::MalformedRecord(_))
        ));
        assert_eq!(rps.acked_through(&pair).unwrap(), 0);
        assert!(rps.metadata().load_ledger(&pair).await.unwrap().is_empty());

        let ack = rps.ingest(record(&pair, 1, 14, 1)).await.unwrap();
        assert_eq!(ack.acked_through, 1);
        let rp = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        assert_eq!(rp.size, 2);
    }

    #[tokio::test]
    async fn test_gap_holds_back_ack() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;

        let ack = rps.ingest(record(&pair, 2, 2, 2)).await.unwrap();
        assert_eq!(ack.acked_through, 0);
        assert!(rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().is_none());

        let ack = rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        assert_eq!(ack.acked_through, 2);
        let rp = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        assert_eq!(rp.sequence_watermark, 2);
    }

    #[tokio::test]
    async fn test_materialize_links_and_skips_empty_interval() {
        let (rps, pair) = rps_with_pair().await;
        let base = baseline(&rps, &pair).await;

        rps.ingest(record(&pair, 1, 4, 7)).await.unwrap();
        let rp = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        assert_eq!(rp.predecessor_rp_id, Some(base.rp_id));
        assert_eq!(rp.size, 2);

        assert!(rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().is_none());
        assert_eq!(rps.list(&pair).unwrap().len(), 2);
        // Ledger truncated with the seal.
        assert!(rps.metadata().load_ledger(&pair).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_materialize_requires_baseline() {
        let (rps, pair) = rps_with_pair().await;
        rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        assert!(matches!(
            rps.materialize_rp(&pair, RpKind::Ccrp).await,
            Err(ReplicationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_materialize_at_partial_watermark() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;
        for seq in 1..=4 {
            rps.ingest(record(&pair, seq, seq * 2, seq as u8)).await.unwrap();
        }
        let rp = rps.materialize_rp_at(&pair, RpKind::Acrp, Some(2)).await.unwrap().unwrap();
        assert_eq!(rp.sequence_watermark, 2);
        assert_eq!(rp.kind, RpKind::Acrp);
        // Not yet acknowledged.
        assert!(rps.materialize_rp_at(&pair, RpKind::Acrp, Some(9)).await.unwrap().is_none());
        let rest = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        assert_eq!(rest.sequence_watermark, 4);
    }

    #[tokio::test]
    async fn test_recover_to_reconstructs_each_point() {
        let (rps, pair) = rps_with_pair().await;
        let base = baseline(&rps, &pair).await;
        rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        let rp1 = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        rps.ingest(record(&pair, 2, 1, 2)).await.unwrap();
        rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();

        let (_, image) = rps.recover_to(&pair, &RecoveryTarget::Rp(base.rp_id)).unwrap();
        assert_eq!(&image.to_bytes()[..4], &[0xAA; 4]);
        let (_, image) = rps.recover_to(&pair, &RecoveryTarget::Rp(rp1.rp_id)).unwrap();
        assert_eq!(&image.to_bytes()[..4], &[1, 1, 0xAA, 0xAA]);
        let (rp, image) = rps.recover_to(&pair, &RecoveryTarget::Latest).unwrap();
        assert_eq!(rp.sequence_watermark, 2);
        assert_eq!(&image.to_bytes()[..4], &[1, 2, 2, 0xAA]);

        assert!(matches!(
            rps.recover_to(&pair, &RecoveryTarget::Rp(99)),
            Err(ReplicationError::RecoveryPointNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_two_phase_preserves_later_images() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;
        rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        let rp2 = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        rps.ingest(record(&pair, 2, 8, 2)).await.unwrap();
        let rp3 = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        let (_, before) = rps.recover_to(&pair, &RecoveryTarget::Latest).unwrap();

        let successor = rps.commit_merge(&pair, rp2.rp_id, rp3.rp_id).await.unwrap();
        assert_eq!(successor.predecessor_rp_id, Some(1));
        assert_eq!(rps.pending_releases(&pair).unwrap(), vec![rp2.rp_id]);
        rps.verify(&pair).unwrap();

        rps.release_merged(&pair, rp2.rp_id).await.unwrap();
        rps.release_merged(&pair, rp2.rp_id).await.unwrap();
        assert!(rps.pending_releases(&pair).unwrap().is_empty());

        let (_, after) = rps.recover_to(&pair, &RecoveryTarget::Latest).unwrap();
        assert_eq!(before, after);
        assert_eq!(rps.list(&pair).unwrap().len(), 2);

        // Plan against the old chain is now stale.
        assert!(matches!(
            rps.commit_merge(&pair, rp2.rp_id, rp3.rp_id).await,
            Err(ReplicationError::MergeConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_resync_swaps_watermark() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;
        rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();

        let mut staged = ExtentMap::new();
        staged.write(10, &[9, 9]);
        let rp = rps.install_resync(&pair, staged, 40).await.unwrap().unwrap();
        assert_eq!(rp.sequence_watermark, 40);
        assert_eq!(rps.acked_through(&pair).unwrap(), 40);

        let (_, image) = rps.recover_to(&pair, &RecoveryTarget::Latest).unwrap();
        let bytes = image.to_bytes();
        assert_eq!(&bytes[..2], &[1, 1]);
        assert_eq!(&bytes[10..12], &[9, 9]);

        // Redelivery of anything at or below the new watermark is a no-op.
        assert_eq!(rps.ingest(record(&pair, 39, 0, 5)).await.unwrap().duplicates, 1);
    }

    #[tokio::test]
    async fn test_install_resync_corrects_diverged_target_in_place() {
        let (rps, pair) = rps_with_pair().await;
        let base = baseline(&rps, &pair).await;
        let mut staged = ExtentMap::new();
        staged.write(0, &[5]);
        assert!(rps.install_resync(&pair, staged, 0).await.unwrap().is_none());

        let chain = rps.list(&pair).unwrap();
        assert_eq!(chain.len(), 1);
        let (_, image) = rps.recover_to(&pair, &RecoveryTarget::Rp(base.rp_id)).unwrap();
        assert_eq!(image.to_bytes()[0], 5);
    }

    #[tokio::test]
    async fn test_rebase_replaces_corrupt_chain() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;
        for seq in 1..=2 {
            rps.ingest(record(&pair, seq, seq * 2, seq as u8)).await.unwrap();
            rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        }
        // Drop the middle RP from the arena, leaving rp 3 pointing at nothing.
        let inner = rps.pair(&pair).unwrap();
        let mut broken = (*inner.snapshot()).clone();
        broken.remove(2);
        inner.publish(broken);
        assert!(matches!(rps.verify(&pair), Err(ReplicationError::ChainCorruption { .. })));

        let mut image = ExtentMap::new();
        image.write(0, &[7; 16]);
        let base = rps.install_rebase(&pair, image, 5, 16).await.unwrap();
        assert_eq!(base.predecessor_rp_id, None);
        assert_eq!(base.rp_id, 4);
        rps.verify(&pair).unwrap();
        assert_eq!(rps.list(&pair).unwrap(), vec![base.clone()]);
        assert_eq!(rps.acked_through(&pair).unwrap(), 5);

        let (_, image) = rps.recover_to(&pair, &RecoveryTarget::Latest).unwrap();
        assert_eq!(image.to_bytes(), vec![7; 16]);

        // The store holds only the new base.
        let stored = rps.metadata().load_chain(&pair).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rp.rp_id, base.rp_id);

        rps.ingest(record(&pair, 6, 0, 9)).await.unwrap();
        let next = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
        assert_eq!(next.predecessor_rp_id, Some(base.rp_id));
    }

    #[tokio::test]
    async fn test_reload_restores_unsealed_ledger() {
        let store = Arc::new(MetadataStore::open(&StoreConfig::in_memory()).await.unwrap());
        let pair = PairId::from("p");
        {
            let rps = RecoveryPointStore::new(Arc::clone(&store));
            rps.register_pair(&pair);
            baseline(&rps, &pair).await;
            rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
            rps.ingest(record(&pair, 2, 0, 2)).await.unwrap();
        }

        let rps = RecoveryPointStore::new(store);
        rps.load_pair(&pair).await.unwrap();
        assert_eq!(rps.acked_through(&pair).unwrap(), 2);
        assert_eq!(rps.list(&pair).unwrap().len(), 1);
        let image = rps.current_image(&pair).await.unwrap();
        assert_eq!(&image.to_bytes()[..2], &[2, 2]);
    }

    #[tokio::test]
    async fn test_recovery_reads_snapshot_during_seal() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;
        let snapshot = rps.chain(&pair).unwrap();

        rps.ingest(record(&pair, 1, 0, 1)).await.unwrap();
        rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(rps.chain(&pair).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_pair_removes_namespace() {
        let (rps, pair) = rps_with_pair().await;
        baseline(&rps, &pair).await;
        rps.drop_pair(&pair).await.unwrap();
        assert!(matches!(rps.list(&pair), Err(ReplicationError::PairNotFound(_))));
        assert!(rps.metadata().load_chain(&pair).await.unwrap().is_empty());
    }
}
