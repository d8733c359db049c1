//! In-memory device. Executes every command on host memory at submit time.
//!
//! Fences either complete immediately (`HostDevice::new`) or only when the caller
//! signals them (`HostDevice::manual`), which lets tests observe deferred behaviour.
//! Any command touching a destroyed resource is counted in `HostStats::invalid_accesses`.

use super::{
    AccelBuildMode, AccelHandle, BufferDesc, BufferHandle, BufferUsage, CommandList,
    FenceValue, GpuCommand, GpuDevice, HeapHandle, ImageHandle, QueueKind,
};
use crate::error::{Error, Result};
use crate::residency::TileCoordinate;
use parking_lot::Mutex;
use std::collections::HashMap;
use vtpack::PackDesc;

/// Counters over everything the device executed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub submissions: u64,
    pub buffer_copies: u64,
    pub scatter_copies: u64,
    pub scatter_runs: u64,
    pub tile_binds: u64,
    pub tile_unbinds: u64,
    pub tile_copies: u64,
    pub accel_builds: u64,
    pub accel_refits: u64,
    pub buffers_destroyed: u64,
    pub heaps_freed: u64,
    pub images_destroyed: u64,
    pub invalid_accesses: u64,
}

struct HostBuffer {
    usage: BufferUsage,
    data: Vec<u8>,
}

struct HostImage {
    desc: PackDesc,
    tiles: HashMap<TileCoordinate, HeapHandle>,
}

#[derive(Default)]
struct HostAccel {
    instance_count: u32,
}

#[derive(Default, Clone, Copy)]
struct HostQueue {
    submitted: FenceValue,
    completed: FenceValue,
}

struct HostState {
    next_handle: u64,
    auto_complete: bool,
    heap_limit: Option<u64>,
    heap_bytes: u64,
    max_buffer_size: Option<u64>,
    buffers: HashMap<BufferHandle, HostBuffer>,
    images: HashMap<ImageHandle, HostImage>,
    heaps: HashMap<HeapHandle, Vec<u8>>,
    accels: HashMap<AccelHandle, HostAccel>,
    queues: [HostQueue; 2],
    stats: HostStats,
}

pub struct HostDevice {
    state: Mutex<HostState>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    /// Device whose fences complete as soon as a submission is executed.
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Device whose fences only advance through `signal`/`complete_all`/`wait_fence`.
    pub fn manual() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(auto_complete: bool) -> Self {
        Self {
            state: Mutex::new(HostState {
                next_handle: 1,
                auto_complete,
                heap_limit: None,
                heap_bytes: 0,
                max_buffer_size: None,
                buffers: HashMap::new(),
                images: HashMap::new(),
                heaps: HashMap::new(),
                accels: HashMap::new(),
                queues: [HostQueue::default(); 2],
                stats: HostStats::default(),
            }),
        }
    }

    /// Makes `allocate_heap` fail once this many heap bytes are live.
    pub fn with_heap_limit(self, bytes: u64) -> Self {
        self.state.lock().heap_limit = Some(bytes);
        self
    }

    /// Marks every submission up to `value` on `queue` as completed.
    /// Makes `create_buffer` fail for buffers larger than `bytes`.
    pub fn set_max_buffer_size(&self, bytes: Option<u64>) {
        self.state.lock().max_buffer_size = bytes;
    }

    pub fn signal(&self, queue: QueueKind, value: FenceValue) {
        let mut state = self.state.lock();
        let q = &mut state.queues[queue.slot()];
        q.completed = q.completed.max(value.min(q.submitted));
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        for q in state.queues.iter_mut() {
            q.completed = q.submitted;
        }
    }

    pub fn submitted_fence(&self, queue: QueueKind) -> FenceValue {
        self.state.lock().queues[queue.slot()].submitted
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_heaps(&self) -> usize {
        self.state.lock().heaps.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn read_buffer(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    /// Contents of the heap currently bound to `tile`, if any.
    pub fn read_tile(&self, image: ImageHandle, tile: TileCoordinate) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let heap = state.images.get(&image)?.tiles.get(&tile)?;
        state.heaps.get(heap).cloned()
    }

    pub fn bound_tiles(&self, image: ImageHandle) -> usize {
        self.state
            .lock()
            .images
            .get(&image)
            .map_or(0, |img| img.tiles.len())
    }

    /// Instance count of the last build or refit of `accel`.
    pub fn accel_instance_count(&self, accel: AccelHandle) -> Option<u32> {
        self.state.lock().accels.get(&accel).map(|a| a.instance_count)
    }
}

impl HostState {
    fn next(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn invalid(&mut self, what: &str) {
        self.stats.invalid_accesses += 1;
        tracing::error!(what, "host device: command touched a destroyed or unknown resource");
    }

    fn copy(&mut self, src: BufferHandle, src_offset: u64, dst: BufferHandle, dst_offset: u64, size: u64) {
        let (s0, s1) = (src_offset as usize, (src_offset + size) as usize);
        let (d0, d1) = (dst_offset as usize, (dst_offset + size) as usize);

        let bytes = match self.buffers.get(&src) {
            Some(b) if s1 <= b.data.len() => b.data[s0..s1].to_vec(),
            _ => return self.invalid("copy source"),
        };

        let fits = self.buffers.get(&dst).is_some_and(|b| d1 <= b.data.len());
        if !fits {
            return self.invalid("copy destination");
        }

        if let Some(b) = self.buffers.get_mut(&dst) {
            b.data[d0..d1].copy_from_slice(&bytes);
        }
    }

    fn execute(&mut self, command: GpuCommand) {
        match command {
            GpuCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.stats.buffer_copies += 1;
                self.copy(src, src_offset, dst, dst_offset, size);
            }
            GpuCommand::ScatterCopy { src, runs } => {
                self.stats.scatter_copies += 1;
                self.stats.scatter_runs += runs.len() as u64;
                for run in runs {
                    self.copy(src, run.src_offset, run.dst, run.dst_offset, run.size);
                }
            }
            GpuCommand::BindTile { image, tile, heap } => {
                if let Some(heap) = heap {
                    self.stats.tile_binds += 1;
                    if !self.heaps.contains_key(&heap) {
                        return self.invalid("bound heap");
                    }
                    match self.images.get_mut(&image) {
                        Some(img) => {
                            img.tiles.insert(tile, heap);
                        }
                        None => self.invalid("bind image"),
                    }
                } else {
                    self.stats.tile_unbinds += 1;
                    match self.images.get_mut(&image) {
                        Some(img) => {
                            img.tiles.remove(&tile);
                        }
                        None => self.invalid("unbind image"),
                    }
                }
            }
            GpuCommand::CopyToTile {
                src,
                src_offset,
                image,
                tile,
            } => {
                self.stats.tile_copies += 1;
                let Some(img) = self.images.get(&image) else {
                    return self.invalid("tile copy image");
                };
                let Some(&heap) = img.tiles.get(&tile) else {
                    return self.invalid("tile copy into unbound tile");
                };
                let len = img.desc.tile_bytes();

                let bytes = match self.buffers.get(&src) {
                    Some(b) if src_offset as usize + len <= b.data.len() => {
                        b.data[src_offset as usize..src_offset as usize + len].to_vec()
                    }
                    _ => return self.invalid("tile copy source"),
                };

                if !self.heaps.contains_key(&heap) {
                    return self.invalid("tile copy heap");
                }
                if let Some(h) = self.heaps.get_mut(&heap) {
                    let n = h.len().min(len);
                    h[..n].copy_from_slice(&bytes[..n]);
                }
            }
            GpuCommand::BuildAccel {
                accel,
                instances,
                count,
                mode,
            } => {
                match mode {
                    AccelBuildMode::Build => self.stats.accel_builds += 1,
                    AccelBuildMode::Refit => self.stats.accel_refits += 1,
                }
                if !self.buffers.contains_key(&instances) {
                    return self.invalid("accel instance buffer");
                }
                match self.accels.get_mut(&accel) {
                    Some(a) => a.instance_count = count,
                    None => self.invalid("accel"),
                }
            }
        }
    }
}

impl GpuDevice for HostDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        if state.max_buffer_size.is_some_and(|max| desc.size > max) {
            return Err(Error::OutOfDeviceMemory { requested: desc.size });
        }

        let handle = BufferHandle(state.next());
        state.buffers.insert(
            handle,
            HostBuffer {
                usage: desc.usage,
                data: vec![0u8; desc.size as usize],
            },
        );
        tracing::trace!(buffer = handle.0, size = desc.size, label = desc.label, "host buffer created");
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.stats.buffers_destroyed += 1;
        } else {
            state.invalid("destroy buffer");
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let writable = state.buffers.get(&buffer).is_some_and(|b| {
            b.usage == BufferUsage::Upload && offset as usize + data.len() <= b.data.len()
        });

        if !writable {
            return state.invalid("write buffer");
        }

        if let Some(b) = state.buffers.get_mut(&buffer) {
            b.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
    }

    fn create_sparse_image(&self, desc: &PackDesc) -> Result<ImageHandle> {
        let mut state = self.state.lock();
        let handle = ImageHandle(state.next());
        state.images.insert(
            handle,
            HostImage {
                desc: *desc,
                tiles: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_some() {
            state.stats.images_destroyed += 1;
        } else {
            state.invalid("destroy image");
        }
    }

    fn allocate_heap(&self, size: u64) -> Result<HeapHandle> {
        let mut state = self.state.lock();
        if let Some(limit) = state.heap_limit {
            if state.heap_bytes + size > limit {
                return Err(Error::OutOfDeviceMemory { requested: size });
            }
        }

        let handle = HeapHandle(state.next());
        state.heaps.insert(handle, vec![0u8; size as usize]);
        state.heap_bytes += size;
        Ok(handle)
    }

    fn free_heap(&self, heap: HeapHandle) {
        let mut state = self.state.lock();
        match state.heaps.remove(&heap) {
            Some(mem) => {
                state.heap_bytes -= mem.len() as u64;
                state.stats.heaps_freed += 1;
            }
            None => state.invalid("free heap"),
        }
    }

    fn create_accel(&self) -> Result<AccelHandle> {
        let mut state = self.state.lock();
        let handle = AccelHandle(state.next());
        state.accels.insert(handle, HostAccel::default());
        Ok(handle)
    }

    fn destroy_accel(&self, accel: AccelHandle) {
        let mut state = self.state.lock();
        if state.accels.remove(&accel).is_none() {
            state.invalid("destroy accel");
        }
    }

    fn submit(&self, queue: QueueKind, commands: CommandList) -> FenceValue {
        let mut state = self.state.lock();
        state.stats.submissions += 1;

        for command in commands {
            state.execute(command);
        }

        let auto = state.auto_complete;
        let q = &mut state.queues[queue.slot()];
        q.submitted += 1;
        if auto {
            q.completed = q.submitted;
        }
        q.submitted
    }

    fn completed_fence(&self, queue: QueueKind) -> FenceValue {
        self.state.lock().queues[queue.slot()].completed
    }

    fn wait_fence(&self, queue: QueueKind, value: FenceValue) {
        self.signal(queue, value);
    }
}
