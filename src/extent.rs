// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sparse byte extents and reconstructed volume images.
//!
//! An [`ExtentMap`] is the delta a recovery point carries: a set of
//! non-overlapping `(offset, bytes)` runs. Writing over an existing run
//! trims or splits it, so the map always holds exactly the latest bytes
//! for every covered offset.
//!
//! ```text
//! before:   [0 ─────── 8)        [12 ── 16)
//! write:          [4 ─────────── 14)
//! after:    [0 ─ 4)[4 ─────────── 14)[14 16)
//! ```

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Non-overlapping byte runs keyed by start offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentMap {
    extents: BTreeMap<u64, Vec<u8>>,
    bytes: u64,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `data` at `offset`, replacing whatever the map held there.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        // Bytes past the end of the address space are not addressable.
        let room = usize::try_from(u64::MAX - offset).unwrap_or(usize::MAX);
        let data = &data[..data.len().min(room)];
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;

        let overlapping: Vec<u64> = self
            .extents
            .range(..end)
            .rev()
            .take_while(|(start, bytes)| **start + bytes.len() as u64 > offset)
            .map(|(start, _)| *start)
            .collect();

        for start in overlapping {
            let Some(existing) = self.extents.remove(&start) else {
                continue;
            };
            self.bytes -= existing.len() as u64;
            let existing_end = start + existing.len() as u64;

            if start < offset {
                let head = existing[..(offset - start) as usize].to_vec();
                self.bytes += head.len() as u64;
                self.extents.insert(start, head);
            }
            if existing_end > end {
                let tail = existing[(end - start) as usize..].to_vec();
                self.bytes += tail.len() as u64;
                self.extents.insert(end, tail);
            }
        }

        self.bytes += data.len() as u64;
        self.extents.insert(offset, data.to_vec());
    }

    /// Apply every extent of `newer` on top of this map.
    pub fn overlay(&mut self, newer: &ExtentMap) {
        for (offset, data) in &newer.extents {
            self.write(*offset, data);
        }
    }

    /// Union of two deltas where `newer` wins on overlap.
    pub fn merged(older: &ExtentMap, newer: &ExtentMap) -> ExtentMap {
        let mut out = older.clone();
        out.overlay(newer);
        out
    }

    /// Copy the covered bytes of `[offset, offset + buf.len())` into `buf`.
    /// Uncovered bytes are left as they are.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let end = offset.saturating_add(buf.len() as u64);
        let first = self
            .extents
            .range(..=offset)
            .next_back()
            .map(|(start, _)| *start)
            .unwrap_or(offset);

        for (start, data) in self.extents.range(first..end) {
            let ext_end = *start + data.len() as u64;
            if ext_end <= offset {
                continue;
            }
            let from = offset.max(*start);
            let to = end.min(ext_end);
            let src = &data[(from - start) as usize..(to - start) as usize];
            buf[(from - offset) as usize..(to - offset) as usize].copy_from_slice(src);
        }
    }

    /// Total bytes held.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.extents.iter().map(|(o, d)| (*o, d.as_slice()))
    }

    /// Highest covered offset + 1.
    pub fn end_offset(&self) -> u64 {
        self.extents
            .iter()
            .next_back()
            .map(|(o, d)| o + d.len() as u64)
            .unwrap_or(0)
    }
}

impl FromIterator<(u64, Vec<u8>)> for ExtentMap {
    fn from_iter<I: IntoIterator<Item = (u64, Vec<u8>)>>(iter: I) -> Self {
        let mut map = ExtentMap::new();
        for (offset, data) in iter {
            map.write(offset, &data);
        }
        map
    }
}

/// A reconstructed target volume as of some recovery point.
///
/// Offsets never written read back as zeroes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeImage {
    volume_size: u64,
    extents: ExtentMap,
}

impl VolumeImage {
    pub fn new(volume_size: u64, extents: ExtentMap) -> Self {
        Self { volume_size, extents }
    }

    pub fn volume_size(&self) -> u64 {
        self.volume_size
    }

    pub fn extents(&self) -> &ExtentMap {
        &self.extents
    }

    /// Read `len` bytes at `offset`, clamped to the volume size.
    pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        let end = offset.saturating_add(len).min(self.volume_size);
        if offset >= end {
            return Vec::new();
        }
        let mut buf = vec![0u8; (end - offset) as usize];
        self.extents.read_into(offset, &mut buf);
        buf
    }

    /// The whole volume as a dense buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.read(0, self.volume_size)
    }

    /// SHA-256 of every `block_size` block, in order.
    pub fn block_checksums(&self, block_size: u64) -> Vec<[u8; 32]> {
        block_checksums_of(self.volume_size, block_size, |offset, len| self.read(offset, len))
    }
}

/// SHA-256 per block over any readable byte source.
pub fn block_checksums_of<F>(volume_size: u64, block_size: u64, mut read: F) -> Vec<[u8; 32]>
where
    F: FnMut(u64, u64) -> Vec<u8>,
{
    let block_size = block_size.max(1);
    let mut sums = Vec::with_capacity(volume_size.div_ceil(block_size) as usize);
    let mut offset = 0;
    while offset < volume_size {
        let len = block_size.min(volume_size - offset);
        let block = read(offset, len);
        sums.push(Sha256::digest(&block).into());
        offset += len;
    }
    sums
}
