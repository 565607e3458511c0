//! Fuzz target for extent map writes and merges.
//!
//! Checks `ExtentMap` against a dense buffer for arbitrary write sequences.

#![no_main]

use libfuzzer_sys::fuzz_target;
use volume_replication::ExtentMap;

const SIZE: usize = u16::MAX as usize + 256;

fuzz_target!(|writes: Vec<(u16, Vec<u8>)>| {
    let mut older = ExtentMap::new();
    let mut newer = ExtentMap::new();
    let mut dense = vec![0u8; SIZE];

    for (i, (offset, data)) in writes.iter().enumerate() {
        let data = &data[..data.len().min(255)];
        if data.is_empty() {
            continue;
        }
        let offset = *offset as usize;
        dense[offset..offset + data.len()].copy_from_slice(data);
        if i % 2 == 0 {
            older.write(offset as u64, data);
        } else {
            newer.write(offset as u64, data);
        }
    }

    // Merge must equal laying `newer` over `older`.
    let merged = ExtentMap::merged(&older, &newer);
    let mut from_merge = vec![0u8; SIZE];
    merged.read_into(0, &mut from_merge);

    let mut expected = vec![0u8; SIZE];
    older.read_into(0, &mut expected);
    newer.read_into(0, &mut expected);
    assert_eq!(from_merge, expected);
    assert_eq!(merged.bytes(), merged.iter().map(|(_, d)| d.len() as u64).sum::<u64>());

    let mut single = ExtentMap::new();
    for (offset, data) in &writes {
        let data = &data[..data.len().min(255)];
        if !data.is_empty() {
            single.write(*offset as u64, data);
        }
    }
    let mut from_single = vec![0u8; SIZE];
    single.read_into(0, &mut from_single);
    assert_eq!(from_single, dense);
});
