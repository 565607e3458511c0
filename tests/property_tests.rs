//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use chrono::Utc;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use volume_replication::coordinator::{evaluate_health, next_state, HealthInputs, HealthVerdict, TransitionContext, Trigger};
use volume_replication::retention::plan_step;
use volume_replication::store::MetadataStore;
use volume_replication::transport::{compress, maybe_decompress};
use volume_replication::{
    ChangeRecord, Command, ExtentMap, Health, PairId, PairState, RecoveryPointStore, RecoveryTarget, RetentionPolicy,
    RpKind, StoreConfig,
};

const VOLUME: usize = 256;

fn write_op() -> impl Strategy<Value = (u64, Vec<u8>)> {
    (0u64..(VOLUME as u64 - 32), prop::collection::vec(any::<u8>(), 1..32))
}

// =============================================================================
// Extent Map Properties
// =============================================================================

proptest! {
    /// An extent map reads back exactly what a dense buffer would hold
    #[test]
    fn extent_map_matches_dense_model(writes in prop::collection::vec(write_op(), 0..40)) {
        let mut map = ExtentMap::new();
        let mut model = vec![0u8; VOLUME];
        for (offset, data) in &writes {
            map.write(*offset, data);
            model[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
        }

        let mut buf = vec![0u8; VOLUME];
        map.read_into(0, &mut buf);
        prop_assert_eq!(buf, model);
    }

    /// Extents never overlap and are kept in offset order
    #[test]
    fn extents_disjoint_and_sorted(writes in prop::collection::vec(write_op(), 0..40)) {
        let mut map = ExtentMap::new();
        for (offset, data) in &writes {
            map.write(*offset, data);
        }

        let mut end = 0u64;
        for (i, (offset, data)) in map.iter().enumerate() {
            prop_assert!(i == 0 || offset >= end, "extent at {} overlaps previous end {}", offset, end);
            prop_assert!(!data.is_empty());
            end = offset + data.len() as u64;
        }
        prop_assert_eq!(map.end_offset(), end);
    }

    /// Merging two deltas equals applying them in order
    #[test]
    fn merged_equals_sequential_application(
        older in prop::collection::vec(write_op(), 0..20),
        newer in prop::collection::vec(write_op(), 0..20),
    ) {
        let mut a = ExtentMap::new();
        let mut sequential = ExtentMap::new();
        for (offset, data) in &older {
            a.write(*offset, data);
            sequential.write(*offset, data);
        }
        let mut b = ExtentMap::new();
        for (offset, data) in &newer {
            b.write(*offset, data);
            sequential.write(*offset, data);
        }

        let merged = ExtentMap::merged(&a, &b);
        let mut left = vec![0u8; VOLUME];
        let mut right = vec![0u8; VOLUME];
        merged.read_into(0, &mut left);
        sequential.read_into(0, &mut right);
        prop_assert_eq!(left, right);
    }
}

// =============================================================================
// Decompression Properties
// =============================================================================

proptest! {
    /// Uncompressed data passes through unchanged
    #[test]
    fn decompress_passthrough_non_zstd(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        let mut safe_data = data;
        if safe_data.len() >= 4 && safe_data[..4] == [0x28, 0xB5, 0x2F, 0xFD] {
            safe_data[0] = 0x00;
        }
        prop_assert_eq!(maybe_decompress(&safe_data).unwrap(), safe_data);
    }

    /// Compressed frames always decode back to the original payload
    #[test]
    fn compress_then_decompress(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let framed = compress(&data).unwrap();
        prop_assert_eq!(maybe_decompress(&framed).unwrap(), data);
    }
}

// =============================================================================
// Recovery Point Chain Properties
// =============================================================================

#[derive(Debug, Clone)]
enum ChainOp {
    Write(u64, Vec<u8>),
    Seal,
    Merge,
}

fn chain_op() -> impl Strategy<Value = ChainOp> {
    prop_oneof![
        4 => write_op().prop_map(|(offset, data)| ChainOp::Write(offset, data)),
        2 => Just(ChainOp::Seal),
        1 => Just(ChainOp::Merge),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

async fn fresh_rps(pair: &PairId) -> RecoveryPointStore {
    let store = MetadataStore::open(&StoreConfig::in_memory()).await.unwrap();
    let rps = RecoveryPointStore::new(Arc::new(store));
    rps.register_pair(pair);
    let mut baseline = ExtentMap::new();
    baseline.write(0, &[0u8; VOLUME]);
    rps.install_baseline(pair, baseline, 0, VOLUME as u64).await.unwrap();
    rps
}

fn record(pair: &PairId, sequence: u64, offset: u64, data: &[u8]) -> ChangeRecord {
    ChangeRecord {
        pair_id: pair.clone(),
        sequence,
        offset,
        length: data.len() as u64,
        payload: data.to_vec(),
        timestamp: Utc::now(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Under any mix of ingest, seal and merge: watermarks strictly increase
    /// along the chain, linkage is intact, and every retained RP still
    /// reconstructs the source as it was when that RP was sealed.
    #[test]
    fn chain_invariants_hold(ops in prop::collection::vec(chain_op(), 1..40)) {
        let pair = PairId::from("prop");
        let policy = RetentionPolicy {
            merge_enabled: true,
            merge_delay: "0s".to_string(),
            retention: "30days".to_string(),
            ..RetentionPolicy::default()
        };

        runtime().block_on(async {
            let rps = fresh_rps(&pair).await;
            let mut source = vec![0u8; VOLUME];
            let mut sequence = 0u64;
            let mut sealed_images: HashMap<u64, Vec<u8>> = HashMap::new();
            sealed_images.insert(rps.latest(&pair).unwrap().unwrap().rp_id, source.clone());

            for op in ops {
                match op {
                    ChainOp::Write(offset, data) => {
                        sequence += 1;
                        source[offset as usize..offset as usize + data.len()].copy_from_slice(&data);
                        rps.ingest(record(&pair, sequence, offset, &data)).await.unwrap();
                    }
                    ChainOp::Seal => {
                        if let Some(rp) = rps.materialize_rp(&pair, RpKind::Ccrp).await.unwrap() {
                            prop_assert_eq!(rp.sequence_watermark, sequence);
                            sealed_images.insert(rp.rp_id, source.clone());
                        }
                    }
                    ChainOp::Merge => {
                        let later = Utc::now() + chrono::Duration::hours(1);
                        let chain = rps.chain(&pair).unwrap();
                        if let Some(job) = plan_step(&pair, &chain, &policy, later) {
                            job.run(&rps).await.unwrap();
                        }
                    }
                }
            }

            rps.verify(&pair).unwrap();
            let points = rps.list(&pair).unwrap();
            prop_assert!(!points.is_empty());
            prop_assert_eq!(points[0].predecessor_rp_id, None);
            for pair_of in points.windows(2) {
                prop_assert!(pair_of[0].sequence_watermark < pair_of[1].sequence_watermark);
                prop_assert_eq!(pair_of[1].predecessor_rp_id, Some(pair_of[0].rp_id));
            }
            for rp in &points {
                let (_, image) = rps.recover_to(&pair, &RecoveryTarget::Rp(rp.rp_id)).unwrap();
                prop_assert_eq!(&image.to_bytes(), &sealed_images[&rp.rp_id]);
            }
            Ok(())
        })?;
    }

    /// Delivering records out of order and repeatedly seals the same image
    /// as delivering them once in order
    #[test]
    fn ingest_is_idempotent_and_order_insensitive(
        writes in prop::collection::vec(write_op(), 1..20),
        shuffle in prop::collection::vec(any::<prop::sample::Index>(), 0..40),
    ) {
        let pair = PairId::from("idem");
        let records: Vec<ChangeRecord> = writes
            .iter()
            .enumerate()
            .map(|(i, (offset, data))| record(&pair, i as u64 + 1, *offset, data))
            .collect();

        let mut noisy = records.clone();
        for index in &shuffle {
            let i = index.index(noisy.len());
            let dup = noisy[i].clone();
            noisy.push(dup);
            let last = noisy.len() - 1;
            noisy.swap(i, last);
        }

        runtime().block_on(async {
            let clean = fresh_rps(&pair).await;
            for r in records.clone() {
                clean.ingest(r).await.unwrap();
            }
            let messy = fresh_rps(&pair).await;
            for r in noisy {
                messy.ingest(r).await.unwrap();
            }

            let last = records.len() as u64;
            prop_assert_eq!(clean.acked_through(&pair).unwrap(), last);
            prop_assert_eq!(messy.acked_through(&pair).unwrap(), last);

            let a = clean.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
            let b = messy.materialize_rp(&pair, RpKind::Ccrp).await.unwrap().unwrap();
            prop_assert_eq!(a.sequence_watermark, b.sequence_watermark);
            let (_, left) = clean.recover_to(&pair, &RecoveryTarget::Latest).unwrap();
            let (_, right) = messy.recover_to(&pair, &RecoveryTarget::Latest).unwrap();
            prop_assert_eq!(left, right);
            Ok(())
        })?;
    }
}

// =============================================================================
// State Machine and Health Properties
// =============================================================================

fn any_state() -> impl Strategy<Value = PairState> {
    prop::sample::select(PairState::ALL.to_vec())
}

fn any_command() -> impl Strategy<Value = Command> {
    prop::sample::select(Command::ALL.to_vec())
}

proptest! {
    /// Deleted is terminal and Stop is always accepted from a live pair
    #[test]
    fn deleted_terminal_stop_universal(
        state in any_state(),
        command in any_command(),
        has_rps in any::<bool>(),
        offline in any::<bool>(),
    ) {
        let ctx = TransitionContext {
            has_recovery_points: has_rps,
            offline_exceeded: offline,
            resync_origin: None,
        };
        let next = next_state(state, Trigger::Command(command), ctx);
        if state == PairState::Deleted {
            prop_assert_eq!(next, None);
        } else if command == Command::Stop {
            prop_assert_eq!(next, Some(PairState::Stopped));
        }
        if next == Some(PairState::Deleted) {
            prop_assert_eq!(state, PairState::Stopped);
        }
    }

    /// The monitor never acts outside Replicating or on a Broken pair
    #[test]
    fn health_monitor_leaves_non_replicating_alone(
        state in any_state(),
        broken in any::<bool>(),
        lag_ms in 0u64..10_000,
        outage_ms in prop::option::of(0u64..10_000),
    ) {
        let inputs = HealthInputs {
            state,
            health: if broken { Health::Broken } else { Health::Ok },
            lag: std::time::Duration::from_millis(lag_ms),
            outage: outage_ms.map(std::time::Duration::from_millis),
            max_rp_interval: std::time::Duration::from_millis(1_000),
            max_rp_offline: std::time::Duration::from_millis(5_000),
        };
        let verdict = evaluate_health(&inputs);
        if broken || state != PairState::Replicating {
            prop_assert_eq!(verdict, HealthVerdict::Unchanged);
        }
    }
}
