// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resync coordinator: baseline transfer, delta resync and full resync.
//!
//! # Baseline
//!
//! ```text
//! start_sequence = source head          (checkpointed before the first block)
//! copy chunks [0, volume_size)          (each chunk persisted with the checkpoint)
//! replay changes > start_sequence       (catch-up, on top of the copied blocks)
//! seal first RP at the replayed watermark, clear the checkpoint
//! ```
//!
//! A baseline interrupted by `stop` resumes from its checkpoint on the next
//! `start`: copied chunks are kept and the buffered delta since
//! `start_sequence` is replayed on top.
//!
//! # Resync
//!
//! `gap = source head - acked_through`. Within `catch_up_threshold`, and while
//! the source still buffers everything after `acked_through`, the buffered
//! changes are replayed in order (delta resync). Otherwise only blocks whose
//! checksum differs from the target's current image are copied, all blocks if
//! the source cannot checksum (full resync), then catch-up runs from the
//! sequence observed before the diff.
//!
//! Either way the result is staged off to the side and installed with a
//! single watermark swap ([`RecoveryPointStore::install_resync`]). A failed
//! resync leaves the chain untouched and keeps no partial state; the next
//! attempt recomputes the gap from scratch.
//!
//! A chain that fails verification (or could not be loaded at all) cannot be
//! diffed against or appended to. Resync then copies every block without reading the target and replaces
//! the chain with a fresh base RP ([`RecoveryPointStore::install_rebase`]).

use crate::admission::AdmissionController;
use crate::config::SeedConfig;
use crate::error::{ReplicationError, Result};
use crate::extent::{ExtentMap, VolumeImage};
use crate::model::{ChangeRecord, PairId, RecoveryPoint, ReplicationPair};
use crate::resilience::{retry, RateLimiter, RetryConfig};
use crate::rps::RecoveryPointStore;
use crate::store::SeedCheckpoint;
use crate::transport::{maybe_decompress, FetchOutcome, Transport};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a pair was (re)seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncMode {
    Baseline,
    Delta,
    Full,
    /// Full copy onto a fresh base after chain corruption.
    Rebase,
}

impl ResyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncMode::Baseline => "baseline",
            ResyncMode::Delta => "delta",
            ResyncMode::Full => "full",
            ResyncMode::Rebase => "rebase",
        }
    }
}

/// Result of a completed seed.
#[derive(Debug, Clone)]
pub struct ResyncOutcome {
    pub mode: ResyncMode,
    /// The RP sealed by the install, if the watermark moved.
    pub rp: Option<RecoveryPoint>,
    /// Sequence the pair is now current through.
    pub watermark: u64,
}

enum CatchUp {
    Caught { delta: ExtentMap, watermark: u64 },
    Evicted { requested: u64, oldest_available: u64 },
}

/// Drives baseline transfers and resyncs for every pair.
pub struct ResyncCoordinator {
    transport: Arc<dyn Transport>,
    rps: Arc<RecoveryPointStore>,
    admission: Arc<AdmissionController>,
    config: SeedConfig,
    batch_size: usize,
    fetch_retry: RetryConfig,
    limiter: Option<RateLimiter>,
}

impl ResyncCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        rps: Arc<RecoveryPointStore>,
        admission: Arc<AdmissionController>,
        config: SeedConfig,
        batch_size: usize,
    ) -> Self {
        let limiter = config.rate_limit_config().map(RateLimiter::new);
        let fetch_retry = RetryConfig::seed(config.fetch_retry_attempts.max(1));
        Self {
            transport,
            rps,
            admission,
            config,
            batch_size: batch_size.max(1),
            fetch_retry,
            limiter,
        }
    }

    /// Override the block read retry schedule.
    #[must_use]
    pub fn with_fetch_retry(mut self, retry: RetryConfig) -> Self {
        self.fetch_retry = retry;
        self
    }

    /// Initial full copy establishing the pair's first RP.
    pub async fn baseline(&self, pair: &ReplicationPair, cancel: &mut watch::Receiver<bool>) -> Result<ResyncOutcome> {
        let started = Instant::now();
        let result = self.run_baseline(pair, cancel).await;
        self.finish(pair, ResyncMode::Baseline, &result, started);
        result
    }

    /// Re-establish consistency for a pair that already has RPs.
    pub async fn resync(&self, pair: &ReplicationPair, cancel: &mut watch::Receiver<bool>) -> Result<ResyncOutcome> {
        let started = Instant::now();
        let pair_id = &pair.pair_id;

        let rebase = match self.rps.verify(pair_id) {
            Err(e) => {
                warn!(pair_id = %pair_id, error = %e, "Chain failed verification, re-seeding onto a fresh base");
                true
            }
            Ok(()) => self.rps.latest(pair_id)?.is_none(),
        };
        if rebase {
            let result = self.run_full(pair, ResyncMode::Rebase, cancel).await;
            self.finish(pair, ResyncMode::Rebase, &result, started);
            return result;
        }

        let acked = self.rps.acked_through(pair_id)?;
        let head = self.source_sequence(pair).await?;
        let gap = head.saturating_sub(acked);

        if gap <= self.config.catch_up_threshold {
            match self.catch_up(pair, acked, cancel).await? {
                CatchUp::Caught { delta, watermark } => {
                    let result = self.install(pair, ResyncMode::Delta, delta, watermark).await;
                    self.finish(pair, ResyncMode::Delta, &result, started);
                    return result;
                }
                CatchUp::Evicted {
                    requested,
                    oldest_available,
                } => {
                    info!(pair_id = %pair_id, requested, oldest_available, "Buffered delta evicted, falling back to full resync");
                }
            }
        } else {
            info!(pair_id = %pair_id, gap, threshold = self.config.catch_up_threshold, "Gap too large for delta resync");
        }

        let result = self.run_full(pair, ResyncMode::Full, cancel).await;
        self.finish(pair, ResyncMode::Full, &result, started);
        result
    }

    fn finish(&self, pair: &ReplicationPair, mode: ResyncMode, result: &Result<ResyncOutcome>, started: Instant) {
        crate::metrics::record_seed_complete(pair.pair_id.as_str(), mode.as_str(), result.is_ok(), started.elapsed());
        match result {
            Ok(outcome) => info!(
                pair_id = %pair.pair_id,
                mode = mode.as_str(),
                watermark = outcome.watermark,
                duration_ms = started.elapsed().as_millis(),
                "Seed complete"
            ),
            Err(ReplicationError::Cancelled) => info!(pair_id = %pair.pair_id, mode = mode.as_str(), "Seed cancelled at checkpoint"),
            Err(e) => warn!(pair_id = %pair.pair_id, mode = mode.as_str(), error = %e, "Seed failed"),
        }
    }

    async fn run_baseline(&self, pair: &ReplicationPair, cancel: &mut watch::Receiver<bool>) -> Result<ResyncOutcome> {
        let pair_id = &pair.pair_id;
        let source = pair.source_volume_ref.as_str();
        let store = self.rps.metadata();
        let volume_size = retry(&self.fetch_retry, "volume_size", || self.transport.volume_size(source)).await?;

        let (mut checkpoint, mut image) = match store.load_seed(pair_id).await? {
            Some((checkpoint, image)) if checkpoint.volume_size == volume_size => {
                info!(
                    pair_id = %pair_id,
                    next_offset = checkpoint.next_offset,
                    start_sequence = checkpoint.start_sequence,
                    "Resuming baseline from checkpoint"
                );
                (checkpoint, image)
            }
            _ => (self.fresh_checkpoint(pair, volume_size).await?, ExtentMap::new()),
        };

        let _reservation = self
            .admission
            .reserve(pair_id, &pair.target_volume_ref, volume_size, cancel)
            .await?;

        for round in 0..self.config.max_catch_up_rounds.max(1) {
            self.copy_range(pair, &mut checkpoint, &mut image, cancel).await?;

            match self.catch_up(pair, checkpoint.start_sequence, cancel).await? {
                CatchUp::Caught { delta, watermark } => {
                    image.overlay(&delta);
                    let rp = self.rps.install_baseline(pair_id, image, watermark, volume_size).await?;
                    self.acknowledge(pair, watermark).await;
                    return Ok(ResyncOutcome {
                        mode: ResyncMode::Baseline,
                        rp: Some(rp),
                        watermark,
                    });
                }
                CatchUp::Evicted {
                    requested,
                    oldest_available,
                } => {
                    warn!(pair_id = %pair_id, round, requested, oldest_available, "Changes since baseline start evicted, recopying");
                    checkpoint = self.fresh_checkpoint(pair, volume_size).await?;
                    image = ExtentMap::new();
                }
            }
        }

        Err(ReplicationError::DeltaEvicted {
            requested: checkpoint.start_sequence,
            oldest_available: checkpoint.start_sequence + 1,
        })
    }

    async fn fresh_checkpoint(&self, pair: &ReplicationPair, volume_size: u64) -> Result<SeedCheckpoint> {
        let checkpoint = SeedCheckpoint {
            pair_id: pair.pair_id.clone(),
            start_sequence: self.source_sequence(pair).await?,
            next_offset: 0,
            volume_size,
        };
        let store = self.rps.metadata();
        store.clear_seed(&pair.pair_id).await?;
        store.save_seed_progress(&checkpoint, None).await?;
        debug!(pair_id = %pair.pair_id, start_sequence = checkpoint.start_sequence, "Baseline checkpoint created");
        Ok(checkpoint)
    }

    /// Copy from the checkpoint to the end of the volume, one persisted chunk
    /// at a time.
    async fn copy_range(
        &self,
        pair: &ReplicationPair,
        checkpoint: &mut SeedCheckpoint,
        image: &mut ExtentMap,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let source = pair.source_volume_ref.as_str();
        let chunk = self.config.chunk_bytes().max(1);
        let store = self.rps.metadata();

        while checkpoint.next_offset < checkpoint.volume_size {
            if *cancel.borrow() {
                return Err(ReplicationError::Cancelled);
            }
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let offset = checkpoint.next_offset;
            let len = chunk.min(checkpoint.volume_size - offset);
            let data = retry(&self.fetch_retry, "fetch_blocks", || self.transport.fetch_blocks(source, offset, len)).await?;

            image.write(offset, &data);
            checkpoint.next_offset = offset + len;
            store.save_seed_progress(checkpoint, Some((offset, &data))).await?;
            crate::metrics::record_seed_bytes(pair.pair_id.as_str(), ResyncMode::Baseline.as_str(), len);
        }
        Ok(())
    }

    /// Copy blocks, replay what changed meanwhile, install. `Full` copies
    /// only blocks that differ from the target; `Rebase` copies all of them.
    async fn run_full(
        &self,
        pair: &ReplicationPair,
        mode: ResyncMode,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ResyncOutcome> {
        let pair_id = &pair.pair_id;
        let source = pair.source_volume_ref.as_str();
        let block_size = self.config.block_size.max(1);

        for round in 0..self.config.max_catch_up_rounds.max(1) {
            let volume_size = retry(&self.fetch_retry, "volume_size", || self.transport.volume_size(source)).await?;
            let start_sequence = self.source_sequence(pair).await?;
            let blocks = match mode {
                ResyncMode::Rebase => (0..volume_size.div_ceil(block_size)).collect(),
                _ => self.differing_blocks(pair, volume_size, block_size).await?,
            };
            let required = blocks.len() as u64 * block_size;
            info!(pair_id = %pair_id, round, mode = mode.as_str(), blocks = blocks.len(), start_sequence, "Full resync scoped");

            let _reservation = self.admission.reserve(pair_id, &pair.target_volume_ref, required, cancel).await?;

            let mut staged = ExtentMap::new();
            for group in blocks.chunks(self.config.chunk_blocks.max(1) as usize) {
                if *cancel.borrow() {
                    return Err(ReplicationError::Cancelled);
                }
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
                for &block in group {
                    let offset = block * block_size;
                    let len = block_size.min(volume_size - offset);
                    let data = retry(&self.fetch_retry, "fetch_blocks", || self.transport.fetch_blocks(source, offset, len)).await?;
                    staged.write(offset, &data);
                    crate::metrics::record_seed_bytes(pair_id.as_str(), mode.as_str(), len);
                }
            }

            match self.catch_up(pair, start_sequence, cancel).await? {
                CatchUp::Caught { delta, watermark } => {
                    staged.overlay(&delta);
                    if mode == ResyncMode::Rebase {
                        let rp = self.rps.install_rebase(pair_id, staged, watermark, volume_size).await?;
                        self.acknowledge(pair, watermark).await;
                        return Ok(ResyncOutcome {
                            mode,
                            rp: Some(rp),
                            watermark,
                        });
                    }
                    return self.install(pair, mode, staged, watermark).await;
                }
                CatchUp::Evicted {
                    requested,
                    oldest_available,
                } => {
                    warn!(pair_id = %pair_id, round, requested, oldest_available, "Changes evicted during full resync, rescoping");
                }
            }
        }

        Err(ReplicationError::DeltaEvicted {
            requested: self.rps.acked_through(pair_id)?,
            oldest_available: self.source_sequence(pair).await?,
        })
    }

    /// Block indices whose contents differ between source and target.
    async fn differing_blocks(&self, pair: &ReplicationPair, volume_size: u64, block_size: u64) -> Result<Vec<u64>> {
        let source = pair.source_volume_ref.as_str();
        let total = volume_size.div_ceil(block_size);
        let source_sums = retry(&self.fetch_retry, "block_checksums", || {
            self.transport.block_checksums(source, block_size)
        })
        .await?;

        let Some(source_sums) = source_sums else {
            debug!(pair_id = %pair.pair_id, blocks = total, "Source cannot checksum, copying every block");
            return Ok((0..total).collect());
        };

        let current = self.rps.current_image(&pair.pair_id).await?;
        let target_sums = VolumeImage::new(volume_size, current.extents().clone()).block_checksums(block_size);
        Ok((0..total)
            .filter(|&i| source_sums.get(i as usize) != target_sums.get(i as usize))
            .collect())
    }

    /// Replay buffered changes after `from` until the source head is reached
    /// or the round budget runs out.
    async fn catch_up(&self, pair: &ReplicationPair, from: u64, cancel: &mut watch::Receiver<bool>) -> Result<CatchUp> {
        let pair_id = &pair.pair_id;
        let source = pair.source_volume_ref.as_str();
        let mut delta = ExtentMap::new();
        let mut after = from;

        for _ in 0..self.config.max_catch_up_rounds.max(1) {
            let target = self.source_sequence(pair).await?;
            while after < target {
                if *cancel.borrow() {
                    return Err(ReplicationError::Cancelled);
                }
                let outcome = retry(&self.fetch_retry, "fetch_changes", || {
                    self.transport.fetch_changes(pair_id, source, after, self.batch_size)
                })
                .await?;

                let records = match outcome {
                    FetchOutcome::Evicted { oldest_available } => {
                        return Ok(CatchUp::Evicted {
                            requested: after,
                            oldest_available,
                        });
                    }
                    FetchOutcome::Records { records, .. } => records,
                };
                if records.is_empty() {
                    break;
                }
                for record in records {
                    if record.sequence <= after {
                        continue;
                    }
                    let record = decode(record)?;
                    delta.write(record.offset, &record.payload);
                    after = record.sequence;
                }
            }
            if after >= self.source_sequence(pair).await? {
                break;
            }
        }

        debug!(pair_id = %pair_id, from, watermark = after, bytes = delta.bytes(), "Catch-up replay complete");
        Ok(CatchUp::Caught { delta, watermark: after })
    }

    async fn install(&self, pair: &ReplicationPair, mode: ResyncMode, staged: ExtentMap, watermark: u64) -> Result<ResyncOutcome> {
        let rp = self.rps.install_resync(&pair.pair_id, staged, watermark).await?;
        self.acknowledge(pair, watermark).await;
        Ok(ResyncOutcome { mode, rp, watermark })
    }

    async fn source_sequence(&self, pair: &ReplicationPair) -> Result<u64> {
        let source = pair.source_volume_ref.as_str();
        retry(&self.fetch_retry, "source_sequence", || self.transport.source_sequence(source)).await
    }

    /// Best effort; live delivery acknowledges again on its next batch.
    async fn acknowledge(&self, pair: &ReplicationPair, through: u64) {
        if let Err(e) = self.transport.acknowledge(&pair.source_volume_ref, through).await {
            debug!(pair_id = %pair.pair_id, through, error = %e, "Acknowledge after seed failed");
        }
    }
}

/// Decompress a delivered record and check it against its declared length.
pub(crate) fn decode(mut record: ChangeRecord) -> Result<ChangeRecord> {
    record.payload = maybe_decompress(&record.payload)?;
    record.validate()?;
    Ok(record)
}
