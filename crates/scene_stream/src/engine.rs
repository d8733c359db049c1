//! Per-frame entry point over every component.
//!
//! Frame protocol, all on the owner thread:
//! 1. mutate instances, lights and tile requests,
//! 2. `before_rendering()` records the frame's commands,
//! 3. `submit_frame(list)` (or submit elsewhere and call `on_frame_end(fence)`).

use crate::config::EngineConfig;
use crate::device::{CommandList, FenceValue, GpuDevice, QueueKind};
use crate::dispose::DisposeQueue;
use crate::error::Result;
use crate::instances::{InstanceId, InstanceTable, MeshRef, ProceduralPrimitive};
use crate::lights::{Light, LightClusters, LightId, SwapBackCmd, TlasUpdate};
use crate::metrics::StreamMetrics;
use crate::residency::TileCoordinate;
use crate::staging::StagingAllocator;
use crate::streaming::{InitCallback, TexId, TileSourceDesc, VirtualTextureStreamer};
use crate::table::MovedEntry;
use crate::upload::UploadBatcher;
use glam::Affine3A;
use std::sync::Arc;

struct FrameStaging {
    staging: StagingAllocator,
    /// Fence of the last frame that used this allocator.
    fence: Option<FenceValue>,
}

pub struct SceneEngine {
    device: Arc<dyn GpuDevice>,
    config: EngineConfig,
    frames: Vec<FrameStaging>,
    recording: Option<usize>,
    frame: u64,
    batcher: UploadBatcher,
    dispose: DisposeQueue,
    instances: InstanceTable,
    lights: LightClusters,
    streamer: VirtualTextureStreamer,
    metrics: StreamMetrics,
    last_tlas: TlasUpdate,
}

impl SceneEngine {
    pub fn new(device: Arc<dyn GpuDevice>, config: EngineConfig) -> Result<Self> {
        let metrics = StreamMetrics::new()?;
        let frames = (0..config.frames_in_flight.max(1))
            .map(|_| FrameStaging {
                staging: StagingAllocator::new(device.clone(), "frame staging", config.staging_chunk_size),
                fence: None,
            })
            .collect();

        let instances = InstanceTable::new(device.clone(), config.initial_instance_capacity)?;
        let lights = LightClusters::new(device.clone(), config.initial_light_capacity)?;
        let streamer = VirtualTextureStreamer::new(
            device.clone(),
            config.streaming.clone(),
            config.staging_chunk_size,
            Some(metrics.clone()),
        )?;

        tracing::info!(
            frames_in_flight = config.frames_in_flight,
            memory_limit = config.streaming.memory_limit,
            "scene engine created"
        );

        Ok(Self {
            dispose: DisposeQueue::new(device.clone()),
            device,
            config,
            frames,
            recording: None,
            frame: 0,
            batcher: UploadBatcher::new(),
            instances,
            lights,
            streamer,
            metrics,
            last_tlas: TlasUpdate::Unchanged,
        })
    }

    // ---- instances ----

    pub fn emplace_mesh_instance(
        &mut self,
        mesh: MeshRef,
        transform: Affine3A,
        visibility: u8,
        opaque: bool,
        materials: &[u32],
        user_id: u32,
    ) -> Result<InstanceId> {
        self.instances
            .emplace_mesh_instance(&mut self.batcher, mesh, transform, visibility, opaque, materials, user_id)
    }

    pub fn emplace_procedural_instance(
        &mut self,
        primitive: ProceduralPrimitive,
        transform: Affine3A,
        visibility: u8,
        user_id: u32,
    ) -> Result<InstanceId> {
        self.instances
            .emplace_procedural_instance(&mut self.batcher, primitive, transform, visibility, user_id)
    }

    pub fn set_transform(&mut self, id: InstanceId, transform: Affine3A, reset_last: bool) -> bool {
        self.instances
            .set_transform(&mut self.batcher, id, transform, reset_last)
    }

    pub fn set_visibility(&mut self, id: InstanceId, mask: u8) -> bool {
        self.instances.set_visibility(&mut self.batcher, id, mask)
    }

    pub fn set_opaque(&mut self, id: InstanceId, opaque: bool) -> bool {
        self.instances.set_opaque(&mut self.batcher, id, opaque)
    }

    /// Returns the instance that took the removed slot, if any.
    pub fn remove_instance(&mut self, id: InstanceId) -> Option<MovedEntry<InstanceId>> {
        self.instances.remove(&mut self.batcher, id)
    }

    // ---- lights ----

    pub fn emplace_light<L: Light>(&mut self, light: L, user_id: u32) -> Result<LightId<L>> {
        self.lights.emplace(&mut self.batcher, light, user_id)
    }

    pub fn update_light<L: Light>(&mut self, id: LightId<L>, light: L) -> bool {
        self.lights.update(&mut self.batcher, id, light)
    }

    pub fn remove_light<L: Light>(&mut self, id: LightId<L>) -> Option<SwapBackCmd> {
        self.lights.remove(&mut self.batcher, id)
    }

    // ---- streaming ----

    pub fn load_sparse_image(
        &mut self,
        source: TileSourceDesc,
        bindless_slot: u32,
        init: Option<InitCallback>,
    ) -> Result<TexId> {
        self.streamer.load_sparse_image(source, bindless_slot, init)
    }

    pub fn unload_sparse_image(&mut self, id: TexId) -> Result<()> {
        self.streamer.unload_sparse_image(id)
    }

    pub fn request_tiles(&mut self, id: TexId, coords: &[TileCoordinate]) -> Result<()> {
        self.streamer.request_tiles(id, coords)
    }

    pub fn release_tiles(&mut self, id: TexId, coords: &[TileCoordinate]) -> Result<()> {
        self.streamer.release_tiles(id, coords)
    }

    pub fn touch_tiles(&mut self, id: TexId, coords: &[TileCoordinate]) -> Result<()> {
        self.streamer.touch_tiles(id, coords)
    }

    // ---- frame ----

    /// Records this frame's commands: tile unbinds, buffer growth copies, batched
    /// uploads, then the instance acceleration build. Call exactly once per frame.
    pub fn before_rendering(&mut self) -> Result<CommandList> {
        let slot = (self.frame % self.frames.len() as u64) as usize;
        let completed = self.device.completed_fence(QueueKind::Graphics);
        {
            let frame = &mut self.frames[slot];
            match frame.fence {
                Some(fence) if fence > completed => {
                    tracing::debug!(slot, fence, completed, "staging still in use; retiring it");
                    frame.staging.retire(&mut self.dispose);
                }
                _ => frame.staging.reset(&mut self.dispose),
            }
        }
        if self.recording.replace(slot).is_some() {
            debug_assert!(false, "before_rendering called twice without on_frame_end");
            tracing::warn!("previous frame was never submitted");
        }

        match self.record(slot) {
            Ok(list) => Ok(list),
            Err(e) => {
                self.recording = None;
                tracing::error!(frame = self.frame, error = %e, "frame recording failed");
                Err(e)
            }
        }
    }

    fn record(&mut self, slot: usize) -> Result<CommandList> {
        let mut list = CommandList::new();
        self.streamer
            .before_rendering(&mut list, &mut self.batcher, &mut self.dispose)?;

        self.instances.update_last_transform(&mut self.batcher);
        self.instances.flush(&mut list, &mut self.dispose);
        self.last_tlas = self
            .lights
            .prepare(&mut self.batcher, &mut list, &mut self.dispose)?;

        let before = self.batcher.committed_bytes();
        let staging = &mut self.frames[slot].staging;
        self.batcher.commit(&mut list, staging)?;
        staging.flush();
        let uploaded = self.batcher.committed_bytes() - before;

        let built = self.instances.build(&mut list);

        self.metrics.upload_bytes_total.inc_by(uploaded);
        self.metrics.instances.set(self.instances.len() as i64);
        self.metrics.lights.set(self.lights.len() as i64);

        tracing::debug!(
            frame = self.frame,
            commands = list.len(),
            uploaded,
            built,
            tlas = ?self.last_tlas,
            "frame recorded"
        );
        self.frame += 1;
        Ok(list)
    }

    /// Submits `list` on the graphics queue and retires the frame.
    pub fn submit_frame(&mut self, list: CommandList) -> FenceValue {
        let fence = self.device.submit(QueueKind::Graphics, list);
        self.on_frame_end(fence);
        fence
    }

    /// Reports the fence of the submission that carried this frame's commands and
    /// reclaims everything whose gate has passed.
    pub fn on_frame_end(&mut self, fence: FenceValue) {
        if let Some(slot) = self.recording.take() {
            self.frames[slot].fence = Some(fence);
        }
        self.streamer.on_commit(fence);
        self.dispose.on_commit(fence);

        let reclaimed = self
            .dispose
            .drain(self.device.completed_fence(QueueKind::Graphics));
        self.metrics.reclaimed_total.inc_by(reclaimed as u64);
    }

    /// Waits for the streaming thread and both queues, then reclaims what that released.
    pub fn force_sync(&mut self) {
        self.streamer.force_sync();

        let last = self.dispose.last_submitted();
        if last > 0 {
            self.device.wait_fence(QueueKind::Graphics, last);
        }

        let reclaimed = self
            .dispose
            .drain(self.device.completed_fence(QueueKind::Graphics));
        self.metrics.reclaimed_total.inc_by(reclaimed as u64);
        tracing::debug!(reclaimed, pending = self.dispose.pending(), "engine synced");
    }

    // ---- accessors ----

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[inline]
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    #[inline]
    pub fn lights(&self) -> &LightClusters {
        &self.lights
    }

    #[inline]
    pub fn streamer(&self) -> &VirtualTextureStreamer {
        &self.streamer
    }

    #[inline]
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    #[inline]
    pub fn dispose(&self) -> &DisposeQueue {
        &self.dispose
    }

    /// How the light hierarchy changed in the last recorded frame.
    #[inline]
    pub fn last_tlas_update(&self) -> TlasUpdate {
        self.last_tlas
    }

    /// Frames recorded so far.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Drop for SceneEngine {
    fn drop(&mut self) {
        self.force_sync();

        self.streamer.release_all(&mut self.dispose);
        self.instances.release(&mut self.dispose);
        self.lights.release(&mut self.dispose);
        for frame in &mut self.frames {
            frame.staging.destroy();
        }

        let n = self.dispose.flush_all();
        tracing::info!(reclaimed = n, "scene engine destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostDevice;
    use crate::lights::PointLight;
    use glam::Vec3;

    fn engine(device: &Arc<HostDevice>) -> SceneEngine {
        let config = EngineConfig {
            initial_instance_capacity: 2,
            initial_light_capacity: 2,
            staging_chunk_size: 1024,
            ..EngineConfig::default()
        };
        SceneEngine::new(device.clone(), config).unwrap()
    }

    fn mesh() -> MeshRef {
        MeshRef { blas: 7 }
    }

    #[test]
    fn empty_frame_records_nothing() {
        let device = Arc::new(HostDevice::new());
        let mut e = engine(&device);

        let list = e.before_rendering().unwrap();
        assert!(list.is_empty());
        e.submit_frame(list);
        assert_eq!(e.last_tlas_update(), TlasUpdate::Unchanged);
    }

    #[test]
    fn growth_keeps_instance_data() {
        let device = Arc::new(HostDevice::new());
        let mut e = engine(&device);

        let ids: Vec<_> = (0..5)
            .map(|i| {
                e.emplace_mesh_instance(mesh(), Affine3A::from_translation(Vec3::X * i as f32), 0xff, true, &[i], i)
                    .unwrap()
            })
            .collect();
        let list = e.before_rendering().unwrap();
        e.submit_frame(list);

        let words = device.read_buffer(e.instances().instance_buffer()).unwrap();
        assert!(words.len() >= 5 * 64);
        assert_eq!(device.accel_instance_count(e.instances().accel()), Some(5));
        for (slot, id) in ids.iter().enumerate() {
            assert_eq!(e.instances().slot_of(*id), Some(slot as u32));
        }
        // The superseded 2- and 4-element buffers are gone once the frame retired.
        assert_eq!(e.dispose().pending(), 0);
    }

    #[test]
    fn lights_rebuild_then_refit() {
        let device = Arc::new(HostDevice::new());
        let mut e = engine(&device);
        let light = |x: f32| PointLight {
            position: Vec3::new(x, 0.0, 0.0),
            radius: 0.5,
            radiance: Vec3::ONE,
        };

        let a = e.emplace_light(light(0.0), 1).unwrap();
        e.emplace_light(light(4.0), 2).unwrap();
        let list = e.before_rendering().unwrap();
        e.submit_frame(list);
        assert_eq!(e.last_tlas_update(), TlasUpdate::Rebuilt);

        assert!(e.update_light(a, light(1.0)));
        let list = e.before_rendering().unwrap();
        e.submit_frame(list);
        assert_eq!(e.last_tlas_update(), TlasUpdate::Refit);
        assert_eq!(e.metrics().lights.get(), 2);
    }

    #[test]
    fn staging_waits_for_its_frame() {
        let device = Arc::new(HostDevice::manual());
        let mut e = engine(&device);
        let id = e
            .emplace_mesh_instance(mesh(), Affine3A::IDENTITY, 1, true, &[], 0)
            .unwrap();

        // Two frames in flight, none completed: the third frame reuses slot 0 whose
        // fence has not passed, so its chunks are retired instead of reset.
        for i in 0..3 {
            e.set_transform(id, Affine3A::from_translation(Vec3::Y * i as f32), false);
            let list = e.before_rendering().unwrap();
            e.submit_frame(list);
        }
        assert!(e.dispose().pending() > 0);

        device.complete_all();
        e.force_sync();
        assert_eq!(e.dispose().pending(), 0);
    }

    #[test]
    fn failed_frame_can_be_recorded_again() {
        let device = Arc::new(HostDevice::new());
        let mut e = engine(&device);
        let id = e
            .emplace_mesh_instance(mesh(), Affine3A::IDENTITY, 1, true, &[], 0)
            .unwrap();

        // The first staging chunk can't be created.
        device.set_max_buffer_size(Some(16));
        assert!(e.before_rendering().is_err());

        device.set_max_buffer_size(None);
        e.set_transform(id, Affine3A::from_translation(Vec3::Z), false);
        let list = e.before_rendering().unwrap();
        assert!(!list.is_empty());
        e.submit_frame(list);
        assert_eq!(e.instances().slot_of(id), Some(0));
    }
}
