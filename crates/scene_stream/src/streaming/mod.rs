//! Sparse virtual texture streaming.
//!
//! Each streamed image owns a [`TileTracker`] and a heap per resident tile. Tile
//! loads run on a background thread (see `worker`); the owner thread applies their
//! completions, evicts tiles by age and by the global byte budget, and publishes
//! the finest fully-resident mip level of every image into a per-bindless-slot
//! `u32` buffer.
//!
//! Eviction order: tiles older than their image's LRU threshold go first. If the
//! budget is still exceeded, further unreferenced tiles are evicted oldest first,
//! ignoring thresholds. Referenced tiles are never evicted.
//!
//! An evicted tile stays `Unloading` until the graphics submission that carries its
//! unbind has completed (reported through [`VirtualTextureStreamer::on_commit`]).
//! Only then can it be loaded again, so a re-bind on the copy queue never races the
//! stale unbind.

pub mod source;
mod worker;

pub use self::source::{TileCallback, TileSource, TileSourceDesc};

use self::worker::{Completion, LoadRequest, Worker, WorkerMsg};
use crate::config::StreamingConfig;
use crate::device::{CommandList, FenceValue, GpuCommand, GpuDevice, HeapHandle, ImageHandle, QueueKind};
use crate::dispose::{DisposeQueue, GpuResource};
use crate::error::{Error, Result};
use crate::metrics::StreamMetrics;
use crate::residency::{ProcessingCounters, TileCoordinate, TileState, TileTracker};
use crate::upload::{DeviceArray, UploadBatcher};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use vtpack::PackDesc;

/// Residency-level value of a slot with nothing resident.
pub const NO_RESIDENT_LEVEL: u32 = u32::MAX;

/// Opaque id of a streamed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TexId(pub u32);

/// Runs once, when every tile of the coarsest mip level became resident.
pub type InitCallback = Box<dyn FnOnce(TexId) + Send>;

/// Image state the streaming thread may hold on to while a load is in flight.
pub(crate) struct SharedImage {
    pub id: TexId,
    pub image: ImageHandle,
    pub desc: PackDesc,
    pub source: Arc<dyn TileSource>,
    pub processing: Arc<ProcessingCounters>,
}

struct TexIndex {
    shared: Arc<SharedImage>,
    tracker: TileTracker,
    heaps: Vec<Option<HeapHandle>>,
    bindless_slot: u32,
    memoryless: bool,
    pending_init: u32,
    init: Option<InitCallback>,
    /// Last level written to the residency buffer; `None` until the first write.
    published: Option<u32>,
    level_dirty: bool,
    unloading: bool,
}

impl TexIndex {
    #[inline]
    fn coarsest_level(&self) -> u16 {
        self.shared.desc.mip_levels - 1
    }

    #[inline]
    fn tile_bytes(&self) -> u64 {
        self.shared.desc.tile_bytes() as u64
    }

    /// Finest level `l` such that every tile of `l` and coarser is resident.
    fn resident_level(&self) -> u32 {
        let mut level = NO_RESIDENT_LEVEL;
        for l in (0..self.shared.desc.mip_levels).rev() {
            let complete = self
                .tracker
                .level_tiles(l)
                .all(|c| self.tracker.state(c) == Some(TileState::Resident));
            if !complete {
                break;
            }
            level = l as u32;
        }
        level
    }

    fn threshold(&self, config: &StreamingConfig) -> u64 {
        if self.memoryless {
            config.lru_frame_memoryless
        } else {
            config.lru_frame
        }
    }
}

pub struct VirtualTextureStreamer {
    device: Arc<dyn GpuDevice>,
    config: StreamingConfig,
    staging_chunk: u64,
    images: BTreeMap<TexId, TexIndex>,
    next_id: u32,
    worker: Option<Worker>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    /// Completions whose copy fence has not passed yet.
    waiting: Vec<Completion>,
    /// Tiles unbound by the frame being recorded.
    recorded_unbinds: Vec<(TexId, usize)>,
    /// Submitted unbinds, with the graphics fence that carries them.
    unbinding: VecDeque<(FenceValue, Vec<(TexId, usize)>)>,
    min_levels: DeviceArray<u32>,
    allocated: u64,
    frame: u64,
    metrics: Option<StreamMetrics>,
}

impl VirtualTextureStreamer {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        config: StreamingConfig,
        staging_chunk: u64,
        metrics: Option<StreamMetrics>,
    ) -> Result<Self> {
        let min_levels = DeviceArray::new(device.as_ref(), "residency levels", config.max_bindless_slots)?;
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            device,
            config,
            staging_chunk,
            images: BTreeMap::new(),
            next_id: 0,
            worker: None,
            done_tx,
            done_rx,
            waiting: Vec::new(),
            recorded_unbinds: Vec::new(),
            unbinding: VecDeque::new(),
            min_levels,
            allocated: 0,
            frame: 0,
            metrics,
        })
    }

    #[inline]
    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    fn ensure_worker(&mut self) -> Result<&Worker> {
        if self.worker.is_none() {
            let worker = Worker::spawn(
                self.device.clone(),
                self.done_tx.clone(),
                self.config.worker_batch,
                self.staging_chunk,
            )
            .map_err(|e| Error::Backend(format!("failed to start tile streaming thread: {e}")))?;
            self.worker = Some(worker);
        }
        self.worker
            .as_ref()
            .ok_or_else(|| Error::Backend("tile streaming thread unavailable".into()))
    }

    /// Registers a streamed image. Only the coarsest mip level is requested; it stays
    /// pinned until the image is unloaded. `init` runs once that level is resident.
    ///
    /// A failed load of a coarsest tile is not retried on its own: `init` stays
    /// pending until that tile is requested again with `request_tiles`.
    pub fn load_sparse_image(
        &mut self,
        source: TileSourceDesc,
        bindless_slot: u32,
        init: Option<InitCallback>,
    ) -> Result<TexId> {
        if bindless_slot >= self.config.max_bindless_slots {
            return Err(Error::BindlessSlotOutOfRange {
                slot: bindless_slot,
                max: self.config.max_bindless_slots,
            });
        }

        let source = source.open()?;
        self.ensure_worker()?;

        let desc = *source.desc();
        let image = self.device.create_sparse_image(&desc)?;
        let tracker = TileTracker::new(&desc);

        let id = TexId(self.next_id);
        self.next_id += 1;

        let footprint = desc.tile_bytes() as u64 * desc.tile_count() as u64;
        let shared = Arc::new(SharedImage {
            id,
            image,
            desc,
            source,
            processing: tracker.processing().clone(),
        });

        let coarsest = desc.mip_levels - 1;
        let pinned: Vec<TileCoordinate> = tracker.level_tiles(coarsest).collect();

        let mut tex = TexIndex {
            shared,
            heaps: vec![None; tracker.len()],
            tracker,
            bindless_slot,
            memoryless: footprint <= self.config.memoryless_threshold,
            pending_init: pinned.len() as u32,
            init,
            published: None,
            level_dirty: true,
            unloading: false,
        };

        let mut to_load = Vec::with_capacity(pinned.len());
        for &c in &pinned {
            if tex.tracker.require_load(c) {
                to_load.push(c);
            }
        }
        self.images.insert(id, tex);
        for c in to_load {
            self.schedule(id, c);
        }

        tracing::info!(
            tex = id.0,
            width = desc.width,
            height = desc.height,
            levels = desc.mip_levels,
            tiles = desc.tile_count(),
            slot = bindless_slot,
            footprint,
            "sparse image registered"
        );
        Ok(id)
    }

    /// Starts a load of `coord` if nothing is in flight for it.
    fn schedule(&mut self, id: TexId, coord: TileCoordinate) {
        let Some(tex) = self.images.get(&id) else {
            return;
        };
        if !tex.tracker.try_load(coord) {
            return;
        }
        let Some(index) = tex.tracker.index(coord) else {
            return;
        };

        let req = LoadRequest {
            image: tex.shared.clone(),
            coord,
            index,
        };

        let rejected = match self.ensure_worker() {
            Ok(worker) => match worker.tx.send(WorkerMsg::Load(req)) {
                Ok(()) => None,
                Err(err) => match err.0 {
                    WorkerMsg::Load(req) => Some(req),
                    WorkerMsg::Shutdown => None,
                },
            },
            Err(e) => {
                tracing::error!(error = %e, "tile request dropped");
                None
            }
        };

        if let Some(req) = rejected {
            tracing::warn!(tex = id.0, "tile streaming thread is gone; request dropped");
            req.image.processing.end(req.index);
        } else if self.worker.is_none() {
            // ensure_worker failed; the request never left this thread
            if let Some(tex) = self.images.get(&id) {
                tex.shared.processing.end(index);
            }
        }
    }

    fn tex_mut(&mut self, id: TexId) -> Result<&mut TexIndex> {
        self.images
            .get_mut(&id)
            .filter(|t| !t.unloading)
            .ok_or(Error::UnknownImage(id))
    }

    /// Feedback entry point: references `coords` and loads those not yet resident.
    /// Every reference must eventually be dropped with `release_tiles`.
    pub fn request_tiles(&mut self, id: TexId, coords: &[TileCoordinate]) -> Result<()> {
        let frame = self.frame;
        let tex = self.tex_mut(id)?;
        if let Some(bad) = coords.iter().find(|c| tex.tracker.index(**c).is_none()) {
            return Err(Error::InvalidTile(*bad));
        }

        let mut to_load = Vec::new();
        for &c in coords {
            if tex.tracker.require_load(c) {
                to_load.push(c);
            }
            tex.tracker.touch(c, frame);
        }

        for c in to_load {
            self.schedule(id, c);
        }
        Ok(())
    }

    /// Drops references taken by `request_tiles`. Allowed while the image is being
    /// unloaded, since teardown waits for these references.
    pub fn release_tiles(&mut self, id: TexId, coords: &[TileCoordinate]) -> Result<()> {
        let tex = self.images.get_mut(&id).ok_or(Error::UnknownImage(id))?;
        if let Some(bad) = coords.iter().find(|c| tex.tracker.index(**c).is_none()) {
            return Err(Error::InvalidTile(*bad));
        }
        for &c in coords {
            tex.tracker.release(c);
        }
        Ok(())
    }

    /// Marks tiles as sampled this frame without referencing them.
    pub fn touch_tiles(&mut self, id: TexId, coords: &[TileCoordinate]) -> Result<()> {
        let frame = self.frame;
        let tex = self.tex_mut(id)?;
        for &c in coords {
            tex.tracker.touch(c, frame);
        }
        Ok(())
    }

    /// Schedules teardown. The image is destroyed once no tile is referenced, resident
    /// or in flight and the streaming thread dropped its last reference to it.
    pub fn unload_sparse_image(&mut self, id: TexId) -> Result<()> {
        let tex = self.tex_mut(id)?;
        tex.unloading = true;
        tex.init = None;

        let coarsest = tex.coarsest_level();
        let pinned: Vec<TileCoordinate> = tex.tracker.level_tiles(coarsest).collect();
        for c in pinned {
            tex.tracker.release(c);
        }

        tracing::info!(tex = id.0, "sparse image unload requested");
        Ok(())
    }

    /// Per-frame step. Records tile unbinds into `list`, residency-level writes into
    /// `batcher`, and hands released heaps and images to `dispose`.
    pub fn before_rendering(
        &mut self,
        list: &mut CommandList,
        batcher: &mut UploadBatcher,
        dispose: &mut DisposeQueue,
    ) -> Result<()> {
        self.frame += 1;

        self.apply_completions(false);
        self.finish_unbinds();
        self.evict_aged(list, dispose);
        self.enforce_budget(list, dispose);
        self.teardown_unloaded(batcher, dispose);
        self.commit_levels(batcher);
        self.min_levels.flush(list, dispose);

        if let Some(m) = &self.metrics {
            m.allocated_bytes.set(self.allocated as i64);
            m.resident_tiles.set(self.resident_tiles() as i64);
        }

        tracing::debug!(
            frame = self.frame,
            images = self.images.len(),
            allocated = self.allocated,
            waiting = self.waiting.len(),
            "streaming frame"
        );
        Ok(())
    }

    fn apply_completions(&mut self, force: bool) {
        self.waiting.extend(self.done_rx.try_iter());
        let completed = self.device.completed_fence(QueueKind::Copy);

        for c in std::mem::take(&mut self.waiting) {
            let ready = match &c {
                Completion::Loaded { fence, .. } => force || *fence <= completed,
                Completion::Failed { .. } => true,
            };
            if ready {
                self.apply(c);
            } else {
                self.waiting.push(c);
            }
        }
    }

    fn apply(&mut self, completion: Completion) {
        let frame = self.frame;
        match completion {
            Completion::Loaded {
                image,
                coord,
                index,
                heap,
                ..
            } => {
                let Some(tex) = self.images.get_mut(&image) else {
                    // Teardown waits for in-flight loads, so this is a stale message.
                    tracing::warn!(tex = image.0, "tile completion for unknown image");
                    self.device.free_heap(heap);
                    return;
                };

                tex.heaps[index] = Some(heap);
                tex.tracker.mark_resident(index);
                tex.shared.processing.end(index);
                tex.tracker.touch(coord, frame);
                tex.level_dirty = true;
                self.allocated += tex.tile_bytes();

                if tex.pending_init > 0 && coord.level == tex.coarsest_level() {
                    tex.pending_init -= 1;
                    if tex.pending_init == 0 {
                        if let Some(init) = tex.init.take() {
                            init(image);
                        }
                    }
                }

                if let Some(m) = &self.metrics {
                    m.tiles_loaded_total.inc();
                }
                tracing::trace!(tex = image.0, level = coord.level, x = coord.x, y = coord.y, "tile resident");
            }
            Completion::Failed { image, coord } => {
                if let Some(m) = &self.metrics {
                    m.tile_load_failures_total.inc();
                }
                tracing::warn!(tex = image.0, level = coord.level, x = coord.x, y = coord.y, "tile load failed; will retry on next request");
            }
        }
    }

    /// Unloads one tile if the tracker allows it right now.
    fn unload_tile(&mut self, id: TexId, index: usize, list: &mut CommandList, dispose: &mut DisposeQueue) -> bool {
        let Some(tex) = self.images.get_mut(&id) else {
            return false;
        };
        let Some(coord) = tex.tracker.coord_at(index) else {
            return false;
        };

        // Same critical section as the ref-count check: a tile required again since
        // it was picked is simply not unloaded.
        if !tex.tracker.try_unload(coord) {
            return false;
        }

        list.push(GpuCommand::BindTile {
            image: tex.shared.image,
            tile: coord,
            heap: None,
        });
        if let Some(heap) = tex.heaps[index].take() {
            dispose.dispose_after_commit(GpuResource::Heap(heap));
        }
        // Tiles of an image being torn down can't be required again.
        if tex.unloading {
            tex.tracker.finish_unload(coord);
        } else {
            self.recorded_unbinds.push((id, index));
        }
        tex.level_dirty = true;
        self.allocated = self.allocated.saturating_sub(tex.tile_bytes());

        if let Some(m) = &self.metrics {
            m.tiles_evicted_total.inc();
        }
        tracing::trace!(tex = id.0, level = coord.level, x = coord.x, y = coord.y, "tile evicted");
        true
    }

    /// Reports the graphics fence of the submission that carried the commands recorded
    /// by the last `before_rendering`.
    pub fn on_commit(&mut self, fence: FenceValue) {
        if !self.recorded_unbinds.is_empty() {
            let tiles = std::mem::take(&mut self.recorded_unbinds);
            self.unbinding.push_back((fence, tiles));
        }
        self.finish_unbinds();
    }

    /// Completes unloads whose unbind executed, and reloads tiles required meanwhile.
    fn finish_unbinds(&mut self) {
        let completed = self.device.completed_fence(QueueKind::Graphics);
        let mut reload = Vec::new();

        while self.unbinding.front().is_some_and(|(fence, _)| *fence <= completed) {
            let Some((_, tiles)) = self.unbinding.pop_front() else {
                break;
            };
            for (id, index) in tiles {
                let Some(tex) = self.images.get_mut(&id) else {
                    continue;
                };
                let Some(coord) = tex.tracker.coord_at(index) else {
                    continue;
                };
                tex.tracker.finish_unload(coord);
                if tex.tracker.ref_count(index) > 0 && !tex.unloading {
                    reload.push((id, coord));
                }
            }
        }

        for (id, coord) in reload {
            tracing::trace!(tex = id.0, level = coord.level, x = coord.x, y = coord.y, "tile required during unload; reloading");
            self.schedule(id, coord);
        }
    }

    fn evict_aged(&mut self, list: &mut CommandList, dispose: &mut DisposeQueue) {
        let frame = self.frame;
        let mut victims = Vec::new();
        for (&id, tex) in &self.images {
            let threshold = tex.threshold(&self.config);
            for (index, last) in tex.tracker.unload_candidates() {
                if tex.unloading || frame.saturating_sub(last) > threshold {
                    victims.push((id, index));
                }
            }
        }

        for (id, index) in victims {
            self.unload_tile(id, index, list, dispose);
        }
    }

    fn enforce_budget(&mut self, list: &mut CommandList, dispose: &mut DisposeQueue) {
        if self.allocated <= self.config.memory_limit {
            return;
        }

        let frame = self.frame;
        // (within age threshold, last used, image, tile): aged-out tiles first, then oldest.
        let mut candidates: Vec<(bool, u64, TexId, usize)> = Vec::new();
        for (&id, tex) in &self.images {
            let threshold = tex.threshold(&self.config);
            for (index, last) in tex.tracker.unload_candidates() {
                candidates.push((frame.saturating_sub(last) <= threshold, last, id, index));
            }
        }
        candidates.sort_unstable();

        let mut evicted = 0u64;
        for (_, _, id, index) in candidates {
            if self.allocated <= self.config.memory_limit {
                break;
            }
            if self.unload_tile(id, index, list, dispose) {
                evicted += 1;
            }
        }

        if let Some(m) = &self.metrics {
            m.budget_evictions_total.inc_by(evicted);
        }
        if self.allocated > self.config.memory_limit {
            tracing::debug!(
                allocated = self.allocated,
                limit = self.config.memory_limit,
                "budget exceeded by referenced or in-flight tiles"
            );
        }
    }

    fn teardown_unloaded(&mut self, batcher: &mut UploadBatcher, dispose: &mut DisposeQueue) {
        let ready: Vec<TexId> = self
            .images
            .iter()
            .filter(|(_, t)| t.unloading && t.tracker.is_idle() && Arc::strong_count(&t.shared) == 1)
            .map(|(&id, _)| id)
            .collect();

        for id in ready {
            let Some(tex) = self.images.remove(&id) else {
                continue;
            };
            dispose.dispose_after_commit(GpuResource::Image(tex.shared.image));
            self.min_levels
                .stage(batcher, tex.bindless_slot, &[NO_RESIDENT_LEVEL]);
            tracing::info!(tex = id.0, "sparse image destroyed");
        }
    }

    fn commit_levels(&mut self, batcher: &mut UploadBatcher) {
        for tex in self.images.values_mut().filter(|t| t.level_dirty) {
            tex.level_dirty = false;
            let level = tex.resident_level();
            if tex.published != Some(level) {
                tex.published = Some(level);
                self.min_levels.stage(batcher, tex.bindless_slot, &[level]);
            }
        }
    }

    /// Waits for submitted unbinds, joins the streaming thread and applies every
    /// outstanding completion. The thread is restarted by the next tile request.
    pub fn force_sync(&mut self) {
        if let Some(&(last, _)) = self.unbinding.back() {
            self.device.wait_fence(QueueKind::Graphics, last);
        }
        self.finish_unbinds();

        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        self.apply_completions(true);
    }

    /// Releases every image and heap. Used at shutdown after `force_sync`.
    pub fn release_all(&mut self, dispose: &mut DisposeQueue) {
        self.force_sync();
        self.recorded_unbinds.clear();
        self.unbinding.clear();
        for (_, mut tex) in std::mem::take(&mut self.images) {
            for heap in tex.heaps.iter_mut().filter_map(Option::take) {
                dispose.dispose_after_commit(GpuResource::Heap(heap));
            }
            dispose.dispose_after_commit(GpuResource::Image(tex.shared.image));
        }
        self.allocated = 0;
        self.min_levels.release(dispose);
    }

    /// Bytes of resident tile heaps.
    #[inline]
    pub fn allocated_size(&self) -> u64 {
        self.allocated
    }

    /// Finest fully-resident level of `id`, or [`NO_RESIDENT_LEVEL`].
    pub fn min_level(&self, id: TexId) -> Option<u32> {
        self.images
            .get(&id)
            .map(|t| t.published.unwrap_or(NO_RESIDENT_LEVEL))
    }

    pub fn tile_state(&self, id: TexId, coord: TileCoordinate) -> Option<TileState> {
        self.images.get(&id)?.tracker.state(coord)
    }

    pub fn image_handle(&self, id: TexId) -> Option<ImageHandle> {
        self.images.get(&id).map(|t| t.shared.image)
    }

    pub fn desc(&self, id: TexId) -> Option<PackDesc> {
        self.images.get(&id).map(|t| t.shared.desc)
    }

    pub fn is_memoryless(&self, id: TexId) -> Option<bool> {
        self.images.get(&id).map(|t| t.memoryless)
    }

    /// Whether `id` is still registered (including images waiting for teardown).
    pub fn contains(&self, id: TexId) -> bool {
        self.images.contains_key(&id)
    }

    pub fn resident_tiles(&self) -> usize {
        self.images.values().map(|t| t.tracker.resident_count()).sum()
    }

    pub fn level_buffer(&self) -> crate::device::BufferHandle {
        self.min_levels.buffer()
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Drop for VirtualTextureStreamer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostDevice;
    use crate::staging::StagingAllocator;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::{Duration, Instant};
    use vtpack::TexelFormat;

    const COARSE: TileCoordinate = TileCoordinate::new(0, 0, 1);

    fn desc() -> PackDesc {
        PackDesc {
            width: 16,
            height: 16,
            mip_levels: 2,
            format: TexelFormat::R8,
            tile_width: 8,
            tile_height: 8,
        }
    }

    fn texel(c: TileCoordinate) -> u8 {
        (c.level as u32 * 16 + c.y * 4 + c.x + 1) as u8
    }

    fn pattern() -> TileSourceDesc {
        TileSourceDesc::callback(desc(), |c, out| {
            out.fill(texel(c));
            Ok(())
        })
    }

    fn config() -> StreamingConfig {
        StreamingConfig {
            memory_limit: 1 << 20,
            memoryless_threshold: 0,
            lru_frame: 3,
            lru_frame_memoryless: 1,
            max_bindless_slots: 8,
            worker_batch: 4,
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct Harness {
        device: Arc<HostDevice>,
        streamer: VirtualTextureStreamer,
        batcher: UploadBatcher,
        staging: StagingAllocator,
        dispose: DisposeQueue,
    }

    impl Harness {
        fn new(device: HostDevice, config: StreamingConfig, metrics: Option<StreamMetrics>) -> Self {
            let device = Arc::new(device);
            let dyn_device: Arc<dyn GpuDevice> = device.clone();
            Self {
                streamer: VirtualTextureStreamer::new(dyn_device.clone(), config, 4096, metrics).unwrap(),
                batcher: UploadBatcher::new(),
                staging: StagingAllocator::new(dyn_device.clone(), "test staging", 4096),
                dispose: DisposeQueue::new(dyn_device),
                device,
            }
        }

        /// One owner frame, submitted on the graphics queue and retired immediately.
        fn frame(&mut self) {
            let mut list = CommandList::new();
            self.streamer
                .before_rendering(&mut list, &mut self.batcher, &mut self.dispose)
                .unwrap();
            self.batcher.commit(&mut list, &mut self.staging).unwrap();
            self.staging.flush();

            let fence = self.device.submit(QueueKind::Graphics, list);
            self.device.signal(QueueKind::Graphics, fence);
            self.streamer.on_commit(fence);
            self.dispose.on_commit(fence);
            self.dispose.drain(self.device.completed_fence(QueueKind::Graphics));
            self.staging.reset_synced();
        }

        fn published_level(&self, slot: u32) -> u32 {
            let bytes = self.device.read_buffer(self.streamer.level_buffer()).unwrap();
            let at = slot as usize * 4;
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        }
    }

    fn level0() -> Vec<TileCoordinate> {
        (0..2).flat_map(|y| (0..2).map(move |x| TileCoordinate::new(x, y, 0))).collect()
    }

    #[test]
    fn coarsest_level_pinned_and_init_runs_once() {
        let mut h = Harness::new(HostDevice::new(), config(), None);
        let seen = Arc::new(AtomicU32::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        let (s, c) = (seen.clone(), calls.clone());

        let id = h
            .streamer
            .load_sparse_image(
                pattern(),
                3,
                Some(Box::new(move |id| {
                    s.store(id.0 + 100, Ordering::SeqCst);
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        h.streamer.force_sync();
        assert_eq!(seen.load(Ordering::SeqCst), id.0 + 100);

        for _ in 0..10 {
            h.frame();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Resident));
        assert_eq!(h.streamer.min_level(id), Some(1));
        assert_eq!(h.published_level(3), 1);
        assert_eq!(h.streamer.allocated_size(), 64);

        let image = h.streamer.image_handle(id).unwrap();
        assert_eq!(h.device.read_tile(image, COARSE), Some(vec![texel(COARSE); 64]));
    }

    #[test]
    fn completions_wait_for_copy_fence() {
        let mut h = Harness::new(HostDevice::manual(), config(), None);
        let id = h.streamer.load_sparse_image(pattern(), 0, None).unwrap();

        wait_until(|| h.device.submitted_fence(QueueKind::Copy) >= 1);
        std::thread::sleep(Duration::from_millis(20));
        h.frame();
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Loading));
        assert_eq!(h.streamer.allocated_size(), 0);
        assert_eq!(h.streamer.min_level(id), Some(NO_RESIDENT_LEVEL));

        let submitted = h.device.submitted_fence(QueueKind::Copy);
        h.device.signal(QueueKind::Copy, submitted);
        wait_until(|| {
            h.frame();
            h.streamer.tile_state(id, COARSE) == Some(TileState::Resident)
        });
        assert_eq!(h.streamer.allocated_size(), 64);
    }

    #[test]
    fn released_tiles_age_out() {
        let mut h = Harness::new(HostDevice::new(), config(), None);
        let id = h.streamer.load_sparse_image(pattern(), 1, None).unwrap();
        let tiles = level0();

        h.streamer.request_tiles(id, &tiles).unwrap();
        h.streamer.force_sync();
        h.frame();
        assert_eq!(h.streamer.min_level(id), Some(0));
        assert_eq!(h.published_level(1), 0);
        assert_eq!(h.streamer.allocated_size(), 5 * 64);

        // Referenced tiles never age out.
        for _ in 0..6 {
            h.frame();
        }
        assert_eq!(h.streamer.resident_tiles(), 5);

        h.streamer.release_tiles(id, &tiles).unwrap();
        for _ in 0..5 {
            h.frame();
        }
        for c in &tiles {
            assert_eq!(h.streamer.tile_state(id, *c), Some(TileState::Unloaded));
        }
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Resident));
        assert_eq!(h.streamer.allocated_size(), 64);
        assert_eq!(h.streamer.min_level(id), Some(1));
        assert_eq!(h.published_level(1), 1);

        let image = h.streamer.image_handle(id).unwrap();
        assert_eq!(h.device.bound_tiles(image), 1);
        assert_eq!(h.device.live_heaps(), 1);
    }

    #[test]
    fn budget_evicts_oldest_unreferenced_first() {
        let cfg = StreamingConfig {
            memory_limit: 3 * 64,
            lru_frame: 1000,
            ..config()
        };
        let metrics = StreamMetrics::new().unwrap();
        let mut h = Harness::new(HostDevice::new(), cfg, Some(metrics.clone()));
        let id = h.streamer.load_sparse_image(pattern(), 0, None).unwrap();
        let tiles = level0();

        h.streamer.request_tiles(id, &tiles).unwrap();
        h.streamer.force_sync();
        h.frame();
        // Everything is referenced: over budget, nothing to evict.
        assert_eq!(h.streamer.allocated_size(), 5 * 64);

        h.streamer.release_tiles(id, &tiles[1..]).unwrap();
        h.streamer.touch_tiles(id, &[tiles[3]]).unwrap();
        h.frame();

        assert_eq!(h.streamer.allocated_size(), 3 * 64);
        assert_eq!(h.streamer.tile_state(id, tiles[0]), Some(TileState::Resident));
        assert_eq!(h.streamer.tile_state(id, tiles[1]), Some(TileState::Unloaded));
        assert_eq!(h.streamer.tile_state(id, tiles[2]), Some(TileState::Unloaded));
        assert_eq!(h.streamer.tile_state(id, tiles[3]), Some(TileState::Resident));
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Resident));
        assert_eq!(metrics.budget_evictions_total.get(), 2);
        assert_eq!(metrics.allocated_bytes.get(), 3 * 64);
    }

    #[test]
    fn failed_tile_can_be_requested_again() {
        let fail_once = Arc::new(AtomicBool::new(true));
        let f = fail_once.clone();
        let flaky = TileCoordinate::new(1, 0, 0);
        let source = TileSourceDesc::callback(desc(), move |c, out| {
            if c == flaky && f.swap(false, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "transient read error"));
            }
            out.fill(texel(c));
            Ok(())
        });

        let metrics = StreamMetrics::new().unwrap();
        let mut h = Harness::new(HostDevice::new(), config(), Some(metrics.clone()));
        let id = h.streamer.load_sparse_image(source, 0, None).unwrap();

        h.streamer.request_tiles(id, &[flaky]).unwrap();
        h.streamer.force_sync();
        h.frame();
        assert_eq!(h.streamer.tile_state(id, flaky), Some(TileState::Unloaded));
        assert_eq!(metrics.tile_load_failures_total.get(), 1);

        h.streamer.request_tiles(id, &[flaky]).unwrap();
        h.streamer.force_sync();
        h.frame();
        assert_eq!(h.streamer.tile_state(id, flaky), Some(TileState::Resident));
        assert!(!fail_once.load(Ordering::SeqCst));
    }

    #[test]
    fn init_waits_for_failed_coarsest_tile_to_be_requested() {
        let fail_once = Arc::new(AtomicBool::new(true));
        let f = fail_once.clone();
        let source = TileSourceDesc::callback(desc(), move |c, out| {
            if c == COARSE && f.swap(false, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "transient read error"));
            }
            out.fill(texel(c));
            Ok(())
        });

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut h = Harness::new(HostDevice::new(), config(), None);
        let id = h
            .streamer
            .load_sparse_image(
                source,
                0,
                Some(Box::new(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        h.streamer.force_sync();
        for _ in 0..3 {
            h.frame();
        }
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Unloaded));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.streamer.request_tiles(id, &[COARSE]).unwrap();
        h.streamer.force_sync();
        h.frame();
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Resident));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.streamer.min_level(id), Some(1));
    }

    #[test]
    fn unload_waits_for_outstanding_references() {
        let mut h = Harness::new(HostDevice::new(), config(), None);
        let id = h.streamer.load_sparse_image(pattern(), 2, None).unwrap();
        let held = TileCoordinate::new(0, 0, 0);

        h.streamer.request_tiles(id, &[held]).unwrap();
        h.streamer.force_sync();
        h.frame();
        assert_eq!(h.device.live_images(), 1);

        h.streamer.unload_sparse_image(id).unwrap();
        assert!(matches!(
            h.streamer.request_tiles(id, &[held]),
            Err(Error::UnknownImage(_))
        ));
        h.frame();
        assert!(h.streamer.contains(id));
        assert_eq!(h.streamer.tile_state(id, COARSE), Some(TileState::Unloaded));
        assert_eq!(h.streamer.tile_state(id, held), Some(TileState::Resident));

        h.streamer.release_tiles(id, &[held]).unwrap();
        h.frame();
        assert!(!h.streamer.contains(id));
        assert_eq!(h.streamer.allocated_size(), 0);
        assert_eq!(h.published_level(2), NO_RESIDENT_LEVEL);
        assert_eq!(h.device.live_images(), 0);
        assert_eq!(h.device.live_heaps(), 0);
        assert_eq!(h.dispose.pending(), 0);
    }

    #[test]
    fn bad_arguments_fail_before_any_state() {
        let mut h = Harness::new(HostDevice::new(), config(), None);

        let err = h.streamer.load_sparse_image(pattern(), 8, None).unwrap_err();
        assert!(matches!(err, Error::BindlessSlotOutOfRange { slot: 8, max: 8 }));

        let err = h
            .streamer
            .load_sparse_image(TileSourceDesc::Path("/nonexistent/scene_stream/x.vtpk".into()), 0, None)
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(h.device.live_images(), 0);

        for bad in [
            PackDesc { mip_levels: 0, ..desc() },
            PackDesc { tile_width: 0, ..desc() },
        ] {
            let source = TileSourceDesc::callback(bad, |_, _| Ok(()));
            let err = h.streamer.load_sparse_image(source, 0, None).unwrap_err();
            assert!(matches!(err, Error::Pack(_)));
        }
        assert_eq!(h.device.live_images(), 0);
        assert!(h.streamer.worker.is_none());

        let id = h.streamer.load_sparse_image(pattern(), 0, None).unwrap();
        let err = h
            .streamer
            .request_tiles(id, &[TileCoordinate::new(2, 0, 0)])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTile(_)));
        assert!(matches!(
            h.streamer.request_tiles(TexId(99), &[COARSE]),
            Err(Error::UnknownImage(TexId(99)))
        ));
    }

    #[test]
    fn evicted_tile_reloads_only_after_its_unbind_executed() {
        let cfg = StreamingConfig {
            lru_frame: 0,
            ..config()
        };
        let mut h = Harness::new(HostDevice::manual(), cfg, None);
        let id = h.streamer.load_sparse_image(pattern(), 0, None).unwrap();
        let tile = TileCoordinate::new(1, 1, 0);

        h.streamer.request_tiles(id, &[tile]).unwrap();
        h.streamer.force_sync();
        assert_eq!(h.streamer.tile_state(id, tile), Some(TileState::Resident));
        h.streamer.release_tiles(id, &[tile]).unwrap();

        let mut list = CommandList::new();
        h.streamer
            .before_rendering(&mut list, &mut h.batcher, &mut h.dispose)
            .unwrap();
        h.batcher.commit(&mut list, &mut h.staging).unwrap();
        h.staging.flush();
        assert_eq!(h.streamer.tile_state(id, tile), Some(TileState::Unloading));
        assert_eq!(h.streamer.allocated_size(), 64);
        assert_eq!(h.streamer.resident_tiles(), 1);

        // Required again before the unbind ran: no load may start yet.
        h.streamer.request_tiles(id, &[tile]).unwrap();
        let fence = h.device.submit(QueueKind::Graphics, list);
        h.streamer.on_commit(fence);
        h.dispose.on_commit(fence);
        assert_eq!(h.streamer.tile_state(id, tile), Some(TileState::Unloading));

        let image = h.streamer.image_handle(id).unwrap();
        assert_eq!(h.device.read_tile(image, tile), None);

        h.device.signal(QueueKind::Graphics, fence);
        h.frame();
        h.streamer.force_sync();
        h.device.complete_all();
        h.frame();

        assert_eq!(h.streamer.tile_state(id, tile), Some(TileState::Resident));
        assert_eq!(h.device.read_tile(image, tile), Some(vec![texel(tile); 64]));
        assert_eq!(h.device.bound_tiles(image), 2);
        assert_eq!(h.streamer.allocated_size(), 2 * 64);
    }

    #[test]
    fn memoryless_images_use_short_threshold() {
        let cfg = StreamingConfig {
            memoryless_threshold: 5 * 64,
            ..config()
        };
        let mut h = Harness::new(HostDevice::new(), cfg, None);
        let id = h.streamer.load_sparse_image(pattern(), 0, None).unwrap();
        assert_eq!(h.streamer.is_memoryless(id), Some(true));

        let tile = TileCoordinate::new(1, 1, 0);
        h.streamer.request_tiles(id, &[tile]).unwrap();
        h.streamer.force_sync();
        h.streamer.release_tiles(id, &[tile]).unwrap();

        // lru_frame_memoryless = 1: gone two frames after its last use.
        h.frame();
        assert_eq!(h.streamer.tile_state(id, tile), Some(TileState::Resident));
        h.frame();
        assert_eq!(h.streamer.tile_state(id, tile), Some(TileState::Unloaded));
    }
}
