// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The recovery point chain as an arena.
//!
//! RPs are stored by id with an explicit `predecessor_rp_id`; nothing holds a
//! pointer to another entry. The oldest live RP is the base image, each later
//! RP carries only the bytes written since its predecessor:
//!
//! ```text
//!   rp 4 (base)      rp 7            rp 9            rp 12 (latest)
//!   pred: None  ◄──  pred: 4   ◄──   pred: 7   ◄──   pred: 9
//!   full image       delta           delta           delta
//! ```
//!
//! Entries folded into a successor by a merge stay in the arena, marked
//! `merged_into`, until the release phase removes them.

use crate::error::{ReplicationError, Result};
use crate::extent::ExtentMap;
use crate::model::{PairId, RecoveryPoint, RecoveryTarget, RpId, RpKind};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One arena slot.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub rp: RecoveryPoint,
    pub delta: Arc<ExtentMap>,
    pub absorbed_rp_id: Option<RpId>,
    pub merged_into: Option<RpId>,
}

impl ChainEntry {
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }
}

/// A pair's recovery points keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RpChain {
    entries: BTreeMap<RpId, ChainEntry>,
}

impl RpChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ChainEntry) {
        self.entries.insert(entry.rp.rp_id, entry);
    }

    pub fn remove(&mut self, rp_id: RpId) -> Option<ChainEntry> {
        self.entries.remove(&rp_id)
    }

    pub fn get(&self, rp_id: RpId) -> Option<&ChainEntry> {
        self.entries.get(&rp_id)
    }

    pub(crate) fn get_mut(&mut self, rp_id: RpId) -> Option<&mut ChainEntry> {
        self.entries.get_mut(&rp_id)
    }

    /// Retained (not merged) entries, oldest first.
    pub fn live(&self) -> impl DoubleEndedIterator<Item = &ChainEntry> {
        self.entries.values().filter(|e| e.is_live())
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.live().next().is_none()
    }

    pub fn latest(&self) -> Option<&ChainEntry> {
        self.live().next_back()
    }

    pub fn root(&self) -> Option<&ChainEntry> {
        self.live().next()
    }

    /// Next id to allocate. Ids are never reused while an entry exists.
    pub fn next_id(&self) -> RpId {
        self.entries.keys().next_back().map(|id| id + 1).unwrap_or(1)
    }

    /// Live entry whose predecessor is `rp_id`.
    pub fn successor_of(&self, rp_id: RpId) -> Option<&ChainEntry> {
        self.live().find(|e| e.rp.predecessor_rp_id == Some(rp_id))
    }

    /// Merged entries still awaiting release.
    pub fn pending_releases(&self) -> Vec<RpId> {
        self.entries
            .values()
            .filter(|e| !e.is_live())
            .map(|e| e.rp.rp_id)
            .collect()
    }

    /// Retained recovery points ordered by creation.
    pub fn recovery_points(&self) -> Vec<RecoveryPoint> {
        self.live().map(|e| e.rp.clone()).collect()
    }

    /// Resolve a recovery target to a retained entry.
    pub fn resolve(&self, target: &RecoveryTarget) -> Option<&ChainEntry> {
        match target {
            RecoveryTarget::Latest => self.latest(),
            RecoveryTarget::Rp(id) => self.get(*id).filter(|e| e.is_live()),
            RecoveryTarget::PointInTime(t) => self.live().rev().find(|e| e.rp.created_at <= *t),
            RecoveryTarget::AppConsistentAt(t) => self
                .live()
                .rev()
                .find(|e| e.rp.kind == RpKind::Acrp && e.rp.created_at <= *t),
        }
    }

    /// Rebuild the extents visible at `rp_id` by overlaying every delta from
    /// the base forward. Returns the image and how many deltas it took.
    pub fn reconstruct(&self, pair_id: &PairId, rp_id: RpId) -> Result<(ExtentMap, usize)> {
        let mut lineage: Vec<&ChainEntry> = Vec::new();
        let mut cursor = Some(rp_id);
        while let Some(id) = cursor {
            let entry = self.get(id).ok_or_else(|| ReplicationError::ChainCorruption {
                pair_id: pair_id.to_string(),
                rp_id: lineage.last().map(|e| e.rp.rp_id).unwrap_or(rp_id),
                detail: format!("predecessor {} missing", id),
            })?;
            if lineage.len() > self.entries.len() {
                return Err(ReplicationError::ChainCorruption {
                    pair_id: pair_id.to_string(),
                    rp_id,
                    detail: "predecessor cycle".into(),
                });
            }
            lineage.push(entry);
            cursor = entry.rp.predecessor_rp_id;
        }

        let depth = lineage.len();
        let mut image = ExtentMap::new();
        for entry in lineage.into_iter().rev() {
            image.overlay(&entry.delta);
        }
        Ok((image, depth))
    }

    /// Linkage integrity scan.
    ///
    /// The oldest live RP has no predecessor, every other live RP points at
    /// the live RP immediately before it, watermarks strictly increase, and
    /// every merged entry names an entry still in the arena.
    pub fn verify(&self, pair_id: &PairId) -> Result<()> {
        let corrupt = |rp_id: RpId, detail: String| ReplicationError::ChainCorruption {
            pair_id: pair_id.to_string(),
            rp_id,
            detail,
        };

        let mut previous: Option<&ChainEntry> = None;
        for entry in self.live() {
            let rp = &entry.rp;
            match previous {
                None => {
                    if let Some(pred) = rp.predecessor_rp_id {
                        return Err(corrupt(rp.rp_id, format!("base points at {}", pred)));
                    }
                }
                Some(prev) => {
                    if rp.predecessor_rp_id != Some(prev.rp.rp_id) {
                        return Err(corrupt(
                            rp.rp_id,
                            format!("predecessor {:?}, expected {}", rp.predecessor_rp_id, prev.rp.rp_id),
                        ));
                    }
                    if rp.sequence_watermark <= prev.rp.sequence_watermark {
                        return Err(corrupt(
                            rp.rp_id,
                            format!(
                                "watermark {} not above predecessor's {}",
                                rp.sequence_watermark, prev.rp.sequence_watermark
                            ),
                        ));
                    }
                }
            }
            previous = Some(entry);
        }

        for entry in self.entries.values().filter(|e| !e.is_live()) {
            if let Some(into) = entry.merged_into {
                if !self.entries.contains_key(&into) {
                    return Err(corrupt(entry.rp.rp_id, format!("merged into missing rp {}", into)));
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<ChainEntry> for RpChain {
    fn from_iter<I: IntoIterator<Item = ChainEntry>>(iter: I) -> Self {
        let mut chain = RpChain::new();
        for entry in iter {
            chain.insert(entry);
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn entry(id: RpId, pred: Option<RpId>, watermark: u64, kind: RpKind, writes: &[(u64, &[u8])]) -> ChainEntry {
        let delta: ExtentMap = writes.iter().map(|(o, d)| (*o, d.to_vec())).collect();
        ChainEntry {
            rp: RecoveryPoint {
                pair_id: PairId::from("p"),
                rp_id: id,
                kind,
                sequence_watermark: watermark,
                created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(id as i64),
                size: delta.bytes(),
                predecessor_rp_id: pred,
                volume_size: 8,
            },
            delta: Arc::new(delta),
            absorbed_rp_id: None,
            merged_into: None,
        }
    }

    fn sample() -> RpChain {
        vec![
            entry(1, None, 10, RpKind::Ccrp, &[(0, &[1; 8])]),
            entry(2, Some(1), 12, RpKind::Acrp, &[(2, &[2, 2])]),
            entry(3, Some(2), 15, RpKind::Ccrp, &[(6, &[3, 3])]),
        ]
        .into_iter()
        .collect()
    }

    fn pair() -> PairId {
        PairId::from("p")
    }

    #[test]
    fn test_reconstruct_overlays_from_base() {
        let chain = sample();
        let (image, depth) = chain.reconstruct(&pair(), 3).unwrap();
        assert_eq!(depth, 3);
        let bytes = crate::extent::VolumeImage::new(8, image).to_bytes();
        assert_eq!(bytes, vec![1, 1, 2, 2, 1, 1, 3, 3]);

        let (image, depth) = chain.reconstruct(&pair(), 1).unwrap();
        assert_eq!(depth, 1);
        assert_eq!(image.bytes(), 8);
    }

    #[test]
    fn test_resolve_targets() {
        let chain = sample();
        assert_eq!(chain.resolve(&RecoveryTarget::Latest).unwrap().rp.rp_id, 3);
        assert_eq!(chain.resolve(&RecoveryTarget::Rp(2)).unwrap().rp.rp_id, 2);
        assert!(chain.resolve(&RecoveryTarget::Rp(9)).is_none());

        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 2, 30).unwrap();
        assert_eq!(chain.resolve(&RecoveryTarget::PointInTime(t)).unwrap().rp.rp_id, 2);
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(chain.resolve(&RecoveryTarget::AppConsistentAt(later)).unwrap().rp.rp_id, 2);
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(chain.resolve(&RecoveryTarget::PointInTime(before)).is_none());
    }

    #[test]
    fn test_verify_accepts_valid_chain() {
        assert!(sample().verify(&pair()).is_ok());
        assert!(RpChain::new().verify(&pair()).is_ok());
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let mut chain = sample();
        chain.get_mut(3).unwrap().rp.predecessor_rp_id = Some(1);
        let err = chain.verify(&pair()).unwrap_err();
        assert!(matches!(err, ReplicationError::ChainCorruption { rp_id: 3, .. }));
    }

    #[test]
    fn test_verify_detects_watermark_regression() {
        let mut chain = sample();
        chain.get_mut(3).unwrap().rp.sequence_watermark = 12;
        assert!(chain.verify(&pair()).is_err());
    }

    #[test]
    fn test_reconstruct_missing_predecessor() {
        let mut chain = sample();
        chain.remove(1);
        assert!(matches!(
            chain.reconstruct(&pair(), 3),
            Err(ReplicationError::ChainCorruption { .. })
        ));
    }

    #[test]
    fn test_merged_entries_are_not_live() {
        let mut chain = sample();
        chain.get_mut(1).unwrap().merged_into = Some(2);
        chain.get_mut(2).unwrap().rp.predecessor_rp_id = None;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.root().unwrap().rp.rp_id, 2);
        assert_eq!(chain.pending_releases(), vec![1]);
        assert_eq!(chain.next_id(), 4);
        assert!(chain.verify(&pair()).is_ok());
        assert!(chain.resolve(&RecoveryTarget::Rp(1)).is_none());
    }

    #[test]
    fn test_successor_of() {
        let chain = sample();
        assert_eq!(chain.successor_of(1).unwrap().rp.rp_id, 2);
        assert!(chain.successor_of(3).is_none());
    }
}
