//! Per-tile residency bookkeeping for one streamed image.
//!
//! Every tile of the mip pyramid has an owner-only reference count and a
//! `processing` counter. The counter is the only field the streaming thread
//! touches, so it lives in [`ProcessingCounters`] behind an `Arc`; everything else
//! in [`TileTracker`] requires `&mut` and therefore the owner thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use vtpack::PackDesc;

/// Address of one tile in the residency pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub x: u32,
    pub y: u32,
    pub level: u16,
}

impl TileCoordinate {
    #[inline]
    pub const fn new(x: u32, y: u32, level: u16) -> Self {
        Self { x, y, level }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Unloaded,
    Loading,
    Resident,
    Unloading,
}

/// In-flight operation counters, one per tile, shared with the streaming thread.
#[derive(Debug)]
pub struct ProcessingCounters(Box<[AtomicU32]>);

impl ProcessingCounters {
    pub fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicU32::new(0)).collect())
    }

    /// Starts an operation: 0 -> 1. Fails if one is already in flight.
    #[inline]
    pub fn try_begin(&self, index: usize) -> bool {
        self.0[index]
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ends the in-flight operation. Returns `false` if none was running.
    pub fn end(&self, index: usize) -> bool {
        let ok = self.0[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok();
        debug_assert!(ok, "processing counter underflow on tile {index}");
        ok
    }

    #[inline]
    pub fn get(&self, index: usize) -> u32 {
        self.0[index].load(Ordering::Acquire)
    }

    pub fn any_in_flight(&self) -> bool {
        self.0.iter().any(|c| c.load(Ordering::Acquire) != 0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct TileTracker {
    desc: PackDesc,
    level_offsets: Vec<usize>,
    ref_counts: Vec<u32>,
    resident: Vec<bool>,
    last_used: Vec<u64>,
    processing: Arc<ProcessingCounters>,
}

impl TileTracker {
    pub fn new(desc: &PackDesc) -> Self {
        let level_offsets: Vec<usize> = (0..=desc.mip_levels).map(|l| desc.level_offset(l)).collect();
        let n = desc.tile_count();

        Self {
            desc: *desc,
            level_offsets,
            ref_counts: vec![0; n],
            resident: vec![false; n],
            last_used: vec![0; n],
            processing: Arc::new(ProcessingCounters::new(n)),
        }
    }

    #[inline]
    pub fn desc(&self) -> &PackDesc {
        &self.desc
    }

    #[inline]
    pub fn processing(&self) -> &Arc<ProcessingCounters> {
        &self.processing
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ref_counts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ref_counts.is_empty()
    }

    #[inline]
    pub fn index(&self, coord: TileCoordinate) -> Option<usize> {
        self.desc.tile_index(coord.level, coord.x, coord.y)
    }

    /// Inverse of [`TileTracker::index`].
    pub fn coord_at(&self, index: usize) -> Option<TileCoordinate> {
        if index >= self.len() {
            return None;
        }

        let level = self.level_offsets.partition_point(|&off| off <= index) - 1;
        let local = (index - self.level_offsets[level]) as u32;
        let (tx, _) = self.desc.mip_grid(level as u16);
        Some(TileCoordinate::new(local % tx, local / tx, level as u16))
    }

    /// Every tile of `level`, row-major.
    pub fn level_tiles(&self, level: u16) -> impl Iterator<Item = TileCoordinate> {
        let (tx, ty) = self.desc.mip_grid(level);
        (0..ty).flat_map(move |y| (0..tx).map(move |x| TileCoordinate::new(x, y, level)))
    }

    /// Begins a load: the tile must not be resident and nothing may be in flight.
    pub fn try_load(&self, coord: TileCoordinate) -> bool {
        let Some(i) = self.index(coord) else {
            return false;
        };
        !self.resident[i] && self.processing.try_begin(i)
    }

    /// Completes a load started by `try_load`. A failed load leaves the tile unloaded.
    pub fn finish_load(&mut self, coord: TileCoordinate, ok: bool) {
        let Some(i) = self.index(coord) else {
            return;
        };
        if ok {
            self.resident[i] = true;
        }
        self.processing.end(i);
    }

    /// Marks a load completed whose processing counter was already released elsewhere.
    pub(crate) fn mark_resident(&mut self, index: usize) {
        self.resident[index] = true;
    }

    /// Begins an unload: the tile must be resident, unreferenced and idle.
    pub fn try_unload(&self, coord: TileCoordinate) -> bool {
        let Some(i) = self.index(coord) else {
            return false;
        };
        self.resident[i] && self.ref_counts[i] == 0 && self.processing.try_begin(i)
    }

    pub fn finish_unload(&mut self, coord: TileCoordinate) {
        let Some(i) = self.index(coord) else {
            return;
        };
        self.resident[i] = false;
        self.processing.end(i);
    }

    /// Adds a reference. Returns whether the caller should start a load.
    pub fn require_load(&mut self, coord: TileCoordinate) -> bool {
        let Some(i) = self.index(coord) else {
            return false;
        };
        self.ref_counts[i] += 1;
        !self.resident[i] && self.processing.get(i) == 0
    }

    /// Drops a reference taken by `require_load`.
    pub fn release(&mut self, coord: TileCoordinate) {
        let Some(i) = self.index(coord) else {
            return;
        };
        if self.ref_counts[i] == 0 {
            debug_assert!(false, "release of unreferenced tile {coord:?}");
            tracing::warn!(level = coord.level, x = coord.x, y = coord.y, "release of unreferenced tile ignored");
            return;
        }
        self.ref_counts[i] -= 1;
    }

    pub fn state(&self, coord: TileCoordinate) -> Option<TileState> {
        let i = self.index(coord)?;
        Some(match (self.resident[i], self.processing.get(i) != 0) {
            (false, false) => TileState::Unloaded,
            (false, true) => TileState::Loading,
            (true, false) => TileState::Resident,
            (true, true) => TileState::Unloading,
        })
    }

    /// Records that `coord` was sampled in `frame`.
    #[inline]
    pub fn touch(&mut self, coord: TileCoordinate, frame: u64) {
        if let Some(i) = self.index(coord) {
            self.last_used[i] = self.last_used[i].max(frame);
        }
    }

    #[inline]
    pub fn ref_count(&self, index: usize) -> u32 {
        self.ref_counts[index]
    }

    #[inline]
    pub fn is_resident(&self, index: usize) -> bool {
        self.resident[index]
    }

    #[inline]
    pub fn last_used(&self, index: usize) -> u64 {
        self.last_used[index]
    }

    /// Resident tiles, not counting those being unloaded.
    pub fn resident_count(&self) -> usize {
        (0..self.len())
            .filter(|&i| self.resident[i] && self.processing.get(i) == 0)
            .count()
    }

    /// Resident tiles that could be unloaded right now, with their last-used frame.
    pub fn unload_candidates(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        (0..self.len()).filter_map(move |i| {
            (self.resident[i] && self.ref_counts[i] == 0 && self.processing.get(i) == 0)
                .then_some((i, self.last_used[i]))
        })
    }

    /// No tile is referenced, resident or in flight.
    pub fn is_idle(&self) -> bool {
        self.ref_counts.iter().all(|r| *r == 0)
            && !self.resident.iter().any(|r| *r)
            && !self.processing.any_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtpack::TexelFormat;

    fn desc() -> PackDesc {
        PackDesc {
            width: 256,
            height: 128,
            mip_levels: 3,
            format: TexelFormat::Rgba8,
            tile_width: 64,
            tile_height: 64,
        }
    }

    #[test]
    fn coord_index_round_trip() {
        let t = TileTracker::new(&desc());
        // 4x2 + 2x1 + 1x1
        assert_eq!(t.len(), 11);
        for i in 0..t.len() {
            let c = t.coord_at(i).unwrap();
            assert_eq!(t.index(c), Some(i));
        }
        assert_eq!(t.coord_at(8), Some(TileCoordinate::new(0, 0, 1)));
        assert_eq!(t.coord_at(11), None);
        assert_eq!(t.level_tiles(0).count(), 8);
    }

    #[test]
    fn load_unload_cycle() {
        let mut t = TileTracker::new(&desc());
        let c = TileCoordinate::new(1, 1, 0);

        assert_eq!(t.state(c), Some(TileState::Unloaded));
        assert!(t.require_load(c));
        assert!(t.try_load(c));
        assert_eq!(t.state(c), Some(TileState::Loading));
        assert!(!t.try_load(c), "second load must hit the processing guard");

        t.finish_load(c, true);
        assert_eq!(t.state(c), Some(TileState::Resident));
        assert!(!t.try_unload(c), "referenced tile must not unload");

        t.release(c);
        assert!(t.try_unload(c));
        assert_eq!(t.state(c), Some(TileState::Unloading));
        t.finish_unload(c);
        assert_eq!(t.state(c), Some(TileState::Unloaded));
    }

    #[test]
    fn unload_of_unloaded_tile_has_no_effect() {
        let t = TileTracker::new(&desc());
        let c = TileCoordinate::new(0, 0, 2);
        assert!(!t.try_unload(c));
        assert_eq!(t.state(c), Some(TileState::Unloaded));
        assert_eq!(t.processing().get(t.index(c).unwrap()), 0);
    }

    #[test]
    fn failed_load_is_retryable() {
        let mut t = TileTracker::new(&desc());
        let c = TileCoordinate::new(0, 0, 1);
        assert!(t.try_load(c));
        t.finish_load(c, false);
        assert_eq!(t.state(c), Some(TileState::Unloaded));
        assert!(t.require_load(c));
        assert!(t.try_load(c));
    }

    #[test]
    fn out_of_chain_coordinates_are_rejected() {
        let mut t = TileTracker::new(&desc());
        let c = TileCoordinate::new(4, 0, 0);
        assert!(!t.try_load(c));
        assert!(!t.require_load(c));
        assert_eq!(t.state(TileCoordinate::new(0, 0, 3)), None);
    }

    #[test]
    fn candidates_skip_referenced_and_busy() {
        let mut t = TileTracker::new(&desc());
        let a = TileCoordinate::new(0, 0, 0);
        let b = TileCoordinate::new(1, 0, 0);
        for c in [a, b] {
            assert!(t.try_load(c));
            t.finish_load(c, true);
        }
        t.require_load(a);
        t.touch(b, 7);

        let cands: Vec<_> = t.unload_candidates().collect();
        assert_eq!(cands, vec![(t.index(b).unwrap(), 7)]);
    }
}
