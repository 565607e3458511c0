// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport contract between the source change tracker and the core.
//!
//! The transport delivers change records in sequence order, at least once,
//! resuming from whatever sequence the caller asks for. It also carries the
//! block-level traffic of baseline and full resync, and the application
//! consistency handshake.
//!
//! Compression is a transport capability: payloads may arrive as zstd frames
//! and are decompressed with [`maybe_decompress`] before ingestion. The
//! record's `length` is always the uncompressed size.
//!
//! [`LoopbackTransport`] connects directly to an in-process
//! [`ChangeTracker`] and can inject disconnects, credential expiry and
//! corrupted payloads.

use crate::collaborators::{BoxFuture, Credential};
use crate::error::{ReplicationError, Result};
use crate::model::{ChangeRecord, PairId};
use crate::tracker::{BufferedChanges, ChangeTracker};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Zstd magic bytes for compressed payload detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compress a payload as a zstd frame.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3).map_err(|e| ReplicationError::Internal(format!("zstd encode: {}", e)))
}

/// Result of a change fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Records after the requested sequence plus the source head at fetch time.
    Records { records: Vec<ChangeRecord>, head_sequence: u64 },
    /// The source no longer holds changes right after the requested sequence.
    Evicted { oldest_available: u64 },
}

/// Source-to-target delivery channel.
pub trait Transport: Send + Sync + 'static {
    /// Up to `limit` change records with sequence > `after`, in order.
    fn fetch_changes<'a>(
        &'a self,
        pair_id: &'a PairId,
        source_ref: &'a str,
        after: u64,
        limit: usize,
    ) -> BoxFuture<'a, FetchOutcome>;

    /// Tell the source everything through `through` is durable on the target.
    fn acknowledge<'a>(&'a self, source_ref: &'a str, through: u64) -> BoxFuture<'a, ()>;

    /// The source's current sequence.
    fn source_sequence<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64>;

    fn volume_size<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64>;

    /// Raw block read for seeding.
    fn fetch_blocks<'a>(&'a self, source_ref: &'a str, offset: u64, len: u64) -> BoxFuture<'a, Vec<u8>>;

    /// Per-block checksums of the source, if supported.
    fn block_checksums<'a>(&'a self, source_ref: &'a str, block_size: u64) -> BoxFuture<'a, Option<Vec<[u8; 32]>>>;

    /// Application-consistency handshake.
    fn quiesce<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64>;

    /// Present a fresh credential after `AuthExpired`.
    fn authenticate<'a>(&'a self, source_ref: &'a str, credential: Credential) -> BoxFuture<'a, ()>;
}

/// In-process transport over a [`ChangeTracker`].
pub struct LoopbackTransport<T: ChangeTracker> {
    tracker: Arc<T>,
    compress: bool,
    connected: AtomicBool,
    authenticated: AtomicBool,
    corrupt_next: AtomicBool,
    stall_quiesce: AtomicBool,
    fetches: AtomicU64,
}

impl<T: ChangeTracker> LoopbackTransport<T> {
    pub fn new(tracker: Arc<T>) -> Self {
        Self {
            tracker,
            compress: false,
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
            corrupt_next: AtomicBool::new(false),
            stall_quiesce: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        }
    }

    /// Send every payload as a zstd frame.
    #[must_use]
    pub fn with_compression(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn tracker(&self) -> &Arc<T> {
        &self.tracker
    }

    /// Simulate a network partition.
    pub fn disconnect(&self) {
        warn!("Loopback transport disconnected");
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        info!("Loopback transport reconnected");
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Invalidate the current credential; calls fail with `AuthExpired`
    /// until `authenticate` is called.
    pub fn expire_credentials(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }

    /// Deliver the next fetched record with a corrupt zstd payload.
    pub fn corrupt_next_payload(&self) {
        self.corrupt_next.store(true, Ordering::SeqCst);
    }

    /// Make the application-consistency handshake hang without answering.
    pub fn stall_quiesce(&self, stalled: bool) {
        self.stall_quiesce.store(stalled, Ordering::SeqCst);
    }

    /// Number of `fetch_changes` calls served.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn check(&self, source_ref: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ReplicationError::disconnected(source_ref, "link down"));
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(ReplicationError::AuthExpired {
                source_ref: source_ref.to_string(),
            });
        }
        Ok(())
    }

    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.corrupt_next.swap(false, Ordering::SeqCst) {
            let mut bad = ZSTD_MAGIC.to_vec();
            bad.extend_from_slice(b"truncated frame");
            return Ok(bad);
        }
        // Raw payloads that look like a frame are sent compressed so the
        // receiver never misreads them.
        if self.compress || data.starts_with(&ZSTD_MAGIC) {
            compress(&data)
        } else {
            Ok(data)
        }
    }
}

impl<T: ChangeTracker> Transport for LoopbackTransport<T> {
    fn fetch_changes<'a>(
        &'a self,
        pair_id: &'a PairId,
        source_ref: &'a str,
        after: u64,
        limit: usize,
    ) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(async move {
            self.check(source_ref)?;
            self.fetches.fetch_add(1, Ordering::Relaxed);

            let head_sequence = self.tracker.current_sequence(source_ref).await?;
            match self.tracker.changes_since(source_ref, after, limit).await? {
                BufferedChanges::Evicted { oldest_available } => {
                    debug!(source = %source_ref, after, oldest_available, "Requested changes evicted");
                    Ok(FetchOutcome::Evicted { oldest_available })
                }
                BufferedChanges::Changes(writes) => {
                    let mut records = Vec::with_capacity(writes.len());
                    for w in writes {
                        let length = w.data.len() as u64;
                        records.push(ChangeRecord {
                            pair_id: pair_id.clone(),
                            sequence: w.sequence,
                            offset: w.offset,
                            length,
                            payload: self.encode(w.data)?,
                            timestamp: w.timestamp,
                        });
                    }
                    Ok(FetchOutcome::Records { records, head_sequence })
                }
            }
        })
    }

    fn acknowledge<'a>(&'a self, source_ref: &'a str, through: u64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.check(source_ref)?;
            self.tracker.acknowledge(source_ref, through).await
        })
    }

    fn source_sequence<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.check(source_ref)?;
            self.tracker.current_sequence(source_ref).await
        })
    }

    fn volume_size<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.check(source_ref)?;
            self.tracker.volume_size(source_ref).await
        })
    }

    fn fetch_blocks<'a>(&'a self, source_ref: &'a str, offset: u64, len: u64) -> BoxFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check(source_ref)?;
            self.tracker.read_range(source_ref, offset, len).await
        })
    }

    fn block_checksums<'a>(&'a self, source_ref: &'a str, block_size: u64) -> BoxFuture<'a, Option<Vec<[u8; 32]>>> {
        Box::pin(async move {
            self.check(source_ref)?;
            self.tracker.block_checksums(source_ref, block_size).await
        })
    }

    fn quiesce<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.check(source_ref)?;
            if self.stall_quiesce.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.tracker.quiesce(source_ref).await
        })
    }

    fn authenticate<'a>(&'a self, source_ref: &'a str, credential: Credential) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(ReplicationError::disconnected(source_ref, "link down"));
            }
            if credential.token.is_empty() || credential.expires_at <= chrono::Utc::now() {
                return Err(ReplicationError::AuthExpired {
                    source_ref: source_ref.to_string(),
                });
            }
            self.authenticated.store(true, Ordering::SeqCst);
            debug!(source = %source_ref, "Transport re-authenticated");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{MemoryChangeTracker, TrackerConfig};
    use chrono::Utc;

    fn setup() -> (Arc<MemoryChangeTracker>, PairId) {
        let tracker = Arc::new(MemoryChangeTracker::new(TrackerConfig::default()));
        tracker.attach("src", 32);
        (tracker, PairId::from("p"))
    }

    fn records(outcome: FetchOutcome) -> Vec<ChangeRecord> {
        match outcome {
            FetchOutcome::Records { records, .. } => records,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_maybe_decompress_uncompressed() {
        let data = b"hello world";
        assert_eq!(maybe_decompress(data).unwrap(), data);
    }

    #[test]
    fn test_maybe_decompress_zstd() {
        let original = b"hello world hello world hello world";
        let compressed = compress(original).unwrap();
        assert_eq!(&compressed[..4], &ZSTD_MAGIC);
        assert_eq!(maybe_decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn test_maybe_decompress_short_data() {
        assert_eq!(maybe_decompress(b"ab").unwrap(), b"ab");
        assert!(maybe_decompress(b"").unwrap().is_empty());
    }

    #[test]
    fn test_maybe_decompress_fake_magic() {
        let mut data = ZSTD_MAGIC.to_vec();
        data.extend_from_slice(b"not valid zstd data");
        assert!(matches!(maybe_decompress(&data), Err(ReplicationError::Decompression(_))));
    }

    #[tokio::test]
    async fn test_fetch_reports_head_and_records() {
        let (tracker, pair) = setup();
        tracker.write("src", 0, &[1, 2, 3]).unwrap();
        tracker.write("src", 8, &[4]).unwrap();
        let transport = LoopbackTransport::new(tracker);

        match transport.fetch_changes(&pair, "src", 0, 1).await.unwrap() {
            FetchOutcome::Records { records, head_sequence } => {
                assert_eq!(head_sequence, 2);
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].sequence, 1);
                assert_eq!(records[0].length, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compressed_payloads_decode() {
        let (tracker, pair) = setup();
        tracker.write("src", 0, &[7; 16]).unwrap();
        let transport = LoopbackTransport::new(tracker).with_compression();

        let recs = records(transport.fetch_changes(&pair, "src", 0, 10).await.unwrap());
        assert!(recs[0].payload.starts_with(&ZSTD_MAGIC));
        assert_eq!(maybe_decompress(&recs[0].payload).unwrap(), vec![7; 16]);
    }

    #[tokio::test]
    async fn test_raw_payload_with_magic_is_framed() {
        let (tracker, pair) = setup();
        tracker.write("src", 0, &ZSTD_MAGIC).unwrap();
        let transport = LoopbackTransport::new(tracker);

        let recs = records(transport.fetch_changes(&pair, "src", 0, 10).await.unwrap());
        assert_eq!(maybe_decompress(&recs[0].payload).unwrap(), ZSTD_MAGIC.to_vec());
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (tracker, pair) = setup();
        let transport = LoopbackTransport::new(tracker);
        transport.disconnect();
        assert!(!transport.is_connected());
        let err = transport.fetch_changes(&pair, "src", 0, 10).await.unwrap_err();
        assert_eq!(err.kind(), "transport_disconnected");
        assert!(transport.source_sequence("src").await.is_err());

        transport.reconnect();
        assert!(transport.is_connected());
        assert!(transport.fetch_changes(&pair, "src", 0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_credentials_until_authenticated() {
        let (tracker, pair) = setup();
        let transport = LoopbackTransport::new(tracker);
        transport.expire_credentials();
        assert!(matches!(
            transport.fetch_changes(&pair, "src", 0, 10).await,
            Err(ReplicationError::AuthExpired { .. })
        ));

        let stale = Credential {
            token: "t".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(transport.authenticate("src", stale).await.is_err());

        let fresh = Credential {
            token: "t".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        transport.authenticate("src", fresh).await.unwrap();
        assert!(transport.fetch_changes(&pair, "src", 0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_next_payload_fails_decode() {
        let (tracker, pair) = setup();
        tracker.write("src", 0, &[1]).unwrap();
        let transport = LoopbackTransport::new(tracker);
        transport.corrupt_next_payload();

        let recs = records(transport.fetch_changes(&pair, "src", 0, 10).await.unwrap());
        assert!(maybe_decompress(&recs[0].payload).is_err());
    }
}
