// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source-side change tracking.
//!
//! A [`ChangeTracker`] sits in the source volume's write path and turns
//! writes into an ordered, gap-free stream of sequence numbers. It keeps a
//! bounded buffer of recent writes so consumers can catch up after an
//! interruption; once the buffer overflows, older changes are either dropped
//! ([`OverflowPolicy::DropOldest`]) or new writes are refused
//! ([`OverflowPolicy::PauseWrites`]). A consumer asking for changes that were
//! dropped gets [`BufferedChanges::Evicted`] and must fall back to a block
//! level re-seed.
//!
//! ```text
//!            acknowledged        buffered (retained)        head
//!  ... ───────────┤ 41 │ 42 │ 43 │ 44 │ 45 │ 46 │ 47 ├──────────►
//!                      ▲                             ▲
//!               oldest_available             current_sequence
//! ```
//!
//! Real trackers are platform specific (kernel filter drivers, hypervisor
//! changed-block tracking). [`MemoryChangeTracker`] is a complete in-process
//! implementation over dense byte buffers.

use crate::collaborators::BoxFuture;
use crate::error::{ReplicationError, Result};
use crate::extent::block_checksums_of;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// One tracked source write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedWrite {
    pub sequence: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Result of reading the change buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferedChanges {
    /// Changes after the requested sequence, in order (possibly empty).
    Changes(Vec<TrackedWrite>),
    /// Some requested changes are no longer buffered.
    Evicted { oldest_available: u64 },
}

/// What to do when the change buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the oldest buffered change; consumers behind it need a re-seed.
    #[default]
    DropOldest,
    /// Refuse the write with `SourceBufferFull`.
    PauseWrites,
}

/// Source change tracker contract, keyed by source volume reference.
pub trait ChangeTracker: Send + Sync + 'static {
    /// Sequence of the newest tracked write (0 if none).
    fn current_sequence<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64>;

    /// Up to `limit` buffered changes with sequence > `after`.
    fn changes_since<'a>(&'a self, source_ref: &'a str, after: u64, limit: usize) -> BoxFuture<'a, BufferedChanges>;

    /// Consumer has durably stored everything up to `through`; the tracker
    /// may discard it.
    fn acknowledge<'a>(&'a self, source_ref: &'a str, through: u64) -> BoxFuture<'a, ()>;

    fn volume_size<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64>;

    /// Current contents of `[offset, offset + len)`, clamped to the volume.
    fn read_range<'a>(&'a self, source_ref: &'a str, offset: u64, len: u64) -> BoxFuture<'a, Vec<u8>>;

    /// Per-block SHA-256 of the current contents, or `None` if the source
    /// cannot checksum.
    fn block_checksums<'a>(&'a self, source_ref: &'a str, block_size: u64) -> BoxFuture<'a, Option<Vec<[u8; 32]>>>;

    /// Application-consistency handshake. Returns the sequence at which the
    /// application was quiesced, or `ConsistencyHandshake` if it refused.
    fn quiesce<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64>;
}

/// Buffer sizing for [`MemoryChangeTracker`].
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 65_536,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

struct SourceVolume {
    data: Vec<u8>,
    sequence: u64,
    buffer: VecDeque<TrackedWrite>,
    app_consistent: bool,
    checksums_supported: bool,
}

impl SourceVolume {
    fn oldest_available(&self) -> u64 {
        self.buffer.front().map(|w| w.sequence).unwrap_or(self.sequence + 1)
    }
}

/// In-process change tracker over dense volumes.
pub struct MemoryChangeTracker {
    config: TrackerConfig,
    volumes: Mutex<HashMap<String, SourceVolume>>,
    bytes_read: AtomicU64,
}

impl MemoryChangeTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            volumes: Mutex::new(HashMap::new()),
            bytes_read: AtomicU64::new(0),
        }
    }

    /// Start tracking a zero-filled volume of `size` bytes.
    pub fn attach(&self, source_ref: &str, size: u64) {
        self.volumes.lock().insert(
            source_ref.to_string(),
            SourceVolume {
                data: vec![0; size as usize],
                sequence: 0,
                buffer: VecDeque::new(),
                app_consistent: true,
                checksums_supported: true,
            },
        );
    }

    /// Apply a source write and assign it the next sequence.
    pub fn write(&self, source_ref: &str, offset: u64, data: &[u8]) -> Result<u64> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(source_ref)
            .ok_or_else(|| ReplicationError::Config(format!("unknown source volume {}", source_ref)))?;

        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= volume.data.len() as u64)
            .ok_or_else(|| {
                ReplicationError::MalformedRecord(format!(
                    "write [{}, +{}) past end of {} ({} bytes)",
                    offset,
                    data.len(),
                    source_ref,
                    volume.data.len()
                ))
            })?;

        if volume.buffer.len() >= self.config.buffer_capacity {
            match self.config.overflow {
                OverflowPolicy::PauseWrites => {
                    return Err(ReplicationError::SourceBufferFull {
                        capacity: self.config.buffer_capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = volume.buffer.pop_front() {
                        debug!(source = %source_ref, sequence = dropped.sequence, "Change buffer full, dropped oldest");
                    }
                }
            }
        }

        volume.data[offset as usize..end as usize].copy_from_slice(data);
        volume.sequence += 1;
        let sequence = volume.sequence;
        if self.config.buffer_capacity > 0 {
            volume.buffer.push_back(TrackedWrite {
                sequence,
                offset,
                data: data.to_vec(),
                timestamp: Utc::now(),
            });
        }
        Ok(sequence)
    }

    /// Snapshot of the whole source volume.
    pub fn volume_bytes(&self, source_ref: &str) -> Option<Vec<u8>> {
        self.volumes.lock().get(source_ref).map(|v| v.data.clone())
    }

    /// Whether the application accepts quiesce requests.
    pub fn set_app_consistency(&self, source_ref: &str, accepts: bool) {
        if let Some(v) = self.volumes.lock().get_mut(source_ref) {
            v.app_consistent = accepts;
        }
    }

    pub fn set_checksums_supported(&self, source_ref: &str, supported: bool) {
        if let Some(v) = self.volumes.lock().get_mut(source_ref) {
            v.checksums_supported = supported;
        }
    }

    /// Drop every buffered change, as if the buffer had overflowed.
    pub fn evict_all(&self, source_ref: &str) {
        if let Some(v) = self.volumes.lock().get_mut(source_ref) {
            warn!(source = %source_ref, evicted = v.buffer.len(), "Evicting change buffer");
            v.buffer.clear();
        }
    }

    /// Number of changes currently buffered.
    pub fn buffered(&self, source_ref: &str) -> usize {
        self.volumes.lock().get(source_ref).map(|v| v.buffer.len()).unwrap_or(0)
    }

    /// Total bytes served by `read_range` across all volumes.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn with_volume<T>(&self, source_ref: &str, f: impl FnOnce(&mut SourceVolume) -> T) -> Result<T> {
        let mut volumes = self.volumes.lock();
        volumes
            .get_mut(source_ref)
            .map(f)
            .ok_or_else(|| ReplicationError::disconnected(source_ref, "unknown source volume"))
    }
}

impl Default for MemoryChangeTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl ChangeTracker for MemoryChangeTracker {
    fn current_sequence<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move { self.with_volume(source_ref, |v| v.sequence) })
    }

    fn changes_since<'a>(&'a self, source_ref: &'a str, after: u64, limit: usize) -> BoxFuture<'a, BufferedChanges> {
        Box::pin(async move {
            self.with_volume(source_ref, |v| {
                let oldest = v.oldest_available();
                if after < v.sequence && after + 1 < oldest {
                    return BufferedChanges::Evicted { oldest_available: oldest };
                }
                let changes = v
                    .buffer
                    .iter()
                    .skip_while(|w| w.sequence <= after)
                    .take(limit)
                    .cloned()
                    .collect();
                BufferedChanges::Changes(changes)
            })
        })
    }

    fn acknowledge<'a>(&'a self, source_ref: &'a str, through: u64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.with_volume(source_ref, |v| {
                while v.buffer.front().is_some_and(|w| w.sequence <= through) {
                    v.buffer.pop_front();
                }
            })
        })
    }

    fn volume_size<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move { self.with_volume(source_ref, |v| v.data.len() as u64) })
    }

    fn read_range<'a>(&'a self, source_ref: &'a str, offset: u64, len: u64) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let bytes = self.with_volume(source_ref, |v| {
                let size = v.data.len() as u64;
                let start = offset.min(size);
                let end = offset.saturating_add(len).min(size);
                v.data[start as usize..end as usize].to_vec()
            })?;
            self.bytes_read.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            Ok(bytes)
        })
    }

    fn block_checksums<'a>(&'a self, source_ref: &'a str, block_size: u64) -> BoxFuture<'a, Option<Vec<[u8; 32]>>> {
        Box::pin(async move {
            self.with_volume(source_ref, |v| {
                if !v.checksums_supported {
                    return None;
                }
                let data = &v.data;
                Some(block_checksums_of(data.len() as u64, block_size, |offset, len| {
                    data[offset as usize..(offset + len) as usize].to_vec()
                }))
            })
        })
    }

    fn quiesce<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let (accepts, sequence) = self.with_volume(source_ref, |v| (v.app_consistent, v.sequence))?;
            if accepts {
                Ok(sequence)
            } else {
                Err(ReplicationError::ConsistencyHandshake(format!(
                    "{}: application declined quiesce",
                    source_ref
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(capacity: usize, overflow: OverflowPolicy) -> MemoryChangeTracker {
        let t = MemoryChangeTracker::new(TrackerConfig {
            buffer_capacity: capacity,
            overflow,
        });
        t.attach("src", 16);
        t
    }

    fn sequences(changes: BufferedChanges) -> Vec<u64> {
        match changes {
            BufferedChanges::Changes(c) => c.into_iter().map(|w| w.sequence).collect(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writes_are_sequenced_and_applied() {
        let t = tracker(8, OverflowPolicy::DropOldest);
        assert_eq!(t.write("src", 0, &[1, 2]).unwrap(), 1);
        assert_eq!(t.write("src", 4, &[3]).unwrap(), 2);
        assert_eq!(t.current_sequence("src").await.unwrap(), 2);
        assert_eq!(t.read_range("src", 0, 5).await.unwrap(), vec![1, 2, 0, 0, 3]);
        assert_eq!(t.bytes_read(), 5);
    }

    #[tokio::test]
    async fn test_changes_since_respects_after_and_limit() {
        let t = tracker(8, OverflowPolicy::DropOldest);
        for i in 0..5 {
            t.write("src", i, &[i as u8]).unwrap();
        }
        assert_eq!(sequences(t.changes_since("src", 2, 10).await.unwrap()), vec![3, 4, 5]);
        assert_eq!(sequences(t.changes_since("src", 0, 2).await.unwrap()), vec![1, 2]);
        assert!(sequences(t.changes_since("src", 5, 10).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_reports_eviction() {
        let t = tracker(2, OverflowPolicy::DropOldest);
        for i in 0..4 {
            t.write("src", i, &[1]).unwrap();
        }
        assert_eq!(
            t.changes_since("src", 0, 10).await.unwrap(),
            BufferedChanges::Evicted { oldest_available: 3 }
        );
        assert_eq!(sequences(t.changes_since("src", 2, 10).await.unwrap()), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_pause_writes_refuses_when_full() {
        let t = tracker(1, OverflowPolicy::PauseWrites);
        t.write("src", 0, &[1]).unwrap();
        let err = t.write("src", 1, &[2]).unwrap_err();
        assert!(matches!(err, ReplicationError::SourceBufferFull { capacity: 1 }));
        // Refused write left the volume untouched.
        assert_eq!(t.volume_bytes("src").unwrap()[1], 0);

        t.acknowledge("src", 1).await.unwrap();
        assert_eq!(t.write("src", 1, &[2]).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_evict_all_then_read_is_evicted() {
        let t = tracker(8, OverflowPolicy::DropOldest);
        t.write("src", 0, &[1]).unwrap();
        t.write("src", 1, &[1]).unwrap();
        t.evict_all("src");
        assert!(matches!(
            t.changes_since("src", 0, 10).await.unwrap(),
            BufferedChanges::Evicted { oldest_available: 3 }
        ));
        // A caller already at the head is not evicted.
        assert!(sequences(t.changes_since("src", 2, 10).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_write_past_end_rejected() {
        let t = tracker(8, OverflowPolicy::DropOldest);
        assert!(t.write("src", 15, &[1, 2]).is_err());
        assert!(t.write("missing", 0, &[1]).is_err());
    }

    #[tokio::test]
    async fn test_quiesce_and_checksum_toggles() {
        let t = tracker(8, OverflowPolicy::DropOldest);
        assert_eq!(t.quiesce("src").await.unwrap(), 0);
        t.set_app_consistency("src", false);
        assert!(matches!(
            t.quiesce("src").await,
            Err(ReplicationError::ConsistencyHandshake(_))
        ));

        assert_eq!(t.block_checksums("src", 4).await.unwrap().unwrap().len(), 4);
        t.set_checksums_supported("src", false);
        assert!(t.block_checksums("src", 4).await.unwrap().is_none());
    }
}
