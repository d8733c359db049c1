//! `wgpu` backend.
//!
//! wgpu exposes neither sparse residency nor ray tracing, so both are emulated:
//! - a sparse image is a regular texture with its full mip chain; tile heaps are
//!   budget bookkeeping and `BindTile` only updates that bookkeeping;
//! - `BuildAccel` records the instance count; the instance buffer itself is real.
//!
//! Upload buffers keep a host shadow so tile copies can go through `Queue::write_texture`
//! without the 256-byte row alignment that buffer-to-texture copies require.

use super::{
    AccelHandle, BufferDesc, BufferHandle, BufferUsage, CommandList, FenceValue, GpuCommand,
    GpuDevice, HeapHandle, ImageHandle, QueueKind,
};
use crate::error::{Error, Result};
use crate::residency::TileCoordinate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vtpack::{PackDesc, TexelFormat};

#[cold]
fn bad_backend(msg: impl std::fmt::Display) -> Error {
    Error::Backend(msg.to_string())
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    shadow: Option<Vec<u8>>,
}

struct GpuImage {
    texture: wgpu::Texture,
    desc: PackDesc,
}

#[derive(Default)]
struct WgpuState {
    next_handle: u64,
    buffers: HashMap<BufferHandle, GpuBuffer>,
    images: HashMap<ImageHandle, GpuImage>,
    heaps: HashMap<HeapHandle, u64>,
    accels: HashMap<AccelHandle, u32>,
    submitted: [FenceValue; 2],
    heap_bytes: u64,
}

impl WgpuState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Holds the wgpu device/queue pair and the handle tables.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<WgpuState>,
    completed: Arc<[AtomicU64; 2]>,
}

fn texture_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TexelFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
        TexelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TexelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TexelFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

#[inline]
fn align4(v: u64) -> u64 {
    (v + 3) & !3
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            state: Mutex::new(WgpuState::default()),
            completed: Arc::new([AtomicU64::new(0), AtomicU64::new(0)]),
        }
    }

    /// Creates a device without a surface, for tools and tests.
    pub fn new_headless() -> Result<Self> {
        pollster::block_on(Self::request_headless())
    }

    async fn request_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference:       wgpu::PowerPreference::HighPerformance,
                compatible_surface:     None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| bad_backend("no suitable GPU adapter"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label:             Some("scene_stream device"),
                    required_features: wgpu::Features::empty(),
                    required_limits:   wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(bad_backend)?;

        tracing::info!(adapter = ?adapter.get_info().name, "wgpu device ready");
        Ok(Self::new(device, queue))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Runs `f` with the texture emulating `image`, e.g. to create a view for sampling.
    pub fn with_texture<R>(&self, image: ImageHandle, f: impl FnOnce(&wgpu::Texture) -> R) -> Option<R> {
        let state = self.state.lock();
        state.images.get(&image).map(|img| f(&img.texture))
    }

    /// Runs `f` with the wgpu buffer behind `buffer`, e.g. to bind it.
    pub fn with_buffer<R>(&self, buffer: BufferHandle, f: impl FnOnce(&wgpu::Buffer) -> R) -> Option<R> {
        let state = self.state.lock();
        state.buffers.get(&buffer).map(|b| f(&b.buffer))
    }

    fn check_oom(&self, requested: u64) -> Result<()> {
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(()),
            Some(wgpu::Error::OutOfMemory { .. }) => Err(Error::OutOfDeviceMemory { requested }),
            Some(e) => Err(bad_backend(e)),
        }
    }

    fn write_tile(&self, state: &WgpuState, src: BufferHandle, src_offset: u64, image: ImageHandle, tile: TileCoordinate) {
        let (Some(buf), Some(img)) = (state.buffers.get(&src), state.images.get(&image)) else {
            tracing::error!(src = src.0, image = image.0, "tile copy references a destroyed resource");
            return;
        };
        let Some(shadow) = buf.shadow.as_ref() else {
            tracing::error!(src = src.0, "tile copy source is not an upload buffer");
            return;
        };

        let desc = &img.desc;
        let len = desc.tile_bytes();
        let start = src_offset as usize;
        if start + len > shadow.len() {
            tracing::error!(src = src.0, "tile copy source out of range");
            return;
        }

        let (level_w, level_h) = desc.level_extent(tile.level);
        let x0 = tile.x * desc.tile_width as u32;
        let y0 = tile.y * desc.tile_height as u32;
        if x0 >= level_w || y0 >= level_h {
            return;
        }

        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture:   &img.texture,
                mip_level: tile.level as u32,
                origin:    wgpu::Origin3d { x: x0, y: y0, z: 0 },
                aspect:    wgpu::TextureAspect::All,
            },
            &shadow[start..start + len],
            wgpu::ImageDataLayout {
                offset:         0,
                bytes_per_row:  Some(desc.tile_row_pitch() as u32),
                rows_per_image: Some(desc.tile_height as u32),
            },
            wgpu::Extent3d {
                width:                 (desc.tile_width as u32).min(level_w - x0),
                height:                (desc.tile_height as u32).min(level_h - y0),
                depth_or_array_layers: 1,
            },
        );
    }
}

impl GpuDevice for WgpuDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let size = align4(desc.size.max(4));
        let usage = match desc.usage {
            BufferUsage::Upload => wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            BufferUsage::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage,
            mapped_at_creation: false,
        });
        self.check_oom(size)?;

        let shadow = (desc.usage == BufferUsage::Upload).then(|| vec![0u8; size as usize]);

        let mut state = self.state.lock();
        let handle = BufferHandle(state.next());
        state.buffers.insert(handle, GpuBuffer { buffer, shadow });
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(b) = self.state.lock().buffers.remove(&buffer) {
            b.buffer.destroy();
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let Some(b) = state.buffers.get_mut(&buffer) else {
            tracing::error!(buffer = buffer.0, "write to destroyed buffer");
            return;
        };
        let Some(shadow) = b.shadow.as_mut() else {
            tracing::error!(buffer = buffer.0, "write_buffer on a storage buffer");
            return;
        };

        let start = offset as usize;
        shadow[start..start + data.len()].copy_from_slice(data);

        // wgpu requires 4-byte aligned writes; widen the range over the shadow.
        let aligned_start = start & !3;
        let aligned_end = (align4((start + data.len()) as u64) as usize).min(shadow.len());
        self.queue
            .write_buffer(&b.buffer, aligned_start as u64, &shadow[aligned_start..aligned_end]);
    }

    fn create_sparse_image(&self, desc: &PackDesc) -> Result<ImageHandle> {
        let requested = desc.tile_bytes() as u64 * desc.tile_count() as u64;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("sparse image"),
            size: wgpu::Extent3d {
                width:                 desc.width,
                height:                desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels as u32,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.check_oom(requested)?;

        let mut state = self.state.lock();
        let handle = ImageHandle(state.next());
        state.images.insert(handle, GpuImage { texture, desc: *desc });
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        if let Some(img) = self.state.lock().images.remove(&image) {
            img.texture.destroy();
        }
    }

    fn allocate_heap(&self, size: u64) -> Result<HeapHandle> {
        let mut state = self.state.lock();
        let handle = HeapHandle(state.next());
        state.heaps.insert(handle, size);
        state.heap_bytes += size;
        Ok(handle)
    }

    fn free_heap(&self, heap: HeapHandle) {
        let mut state = self.state.lock();
        if let Some(size) = state.heaps.remove(&heap) {
            state.heap_bytes -= size;
        }
    }

    fn create_accel(&self) -> Result<AccelHandle> {
        let mut state = self.state.lock();
        let handle = AccelHandle(state.next());
        state.accels.insert(handle, 0);
        Ok(handle)
    }

    fn destroy_accel(&self, accel: AccelHandle) {
        self.state.lock().accels.remove(&accel);
    }

    fn submit(&self, queue: QueueKind, commands: CommandList) -> FenceValue {
        let mut state = self.state.lock();

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(match queue {
                    QueueKind::Graphics => "scene_stream frame encoder",
                    QueueKind::Copy => "scene_stream copy encoder",
                }),
            });

        for command in commands {
            match command {
                GpuCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => match (state.buffers.get(&src), state.buffers.get(&dst)) {
                    (Some(s), Some(d)) => {
                        encoder.copy_buffer_to_buffer(&s.buffer, src_offset, &d.buffer, dst_offset, align4(size));
                    }
                    _ => tracing::error!(src = src.0, dst = dst.0, "copy references a destroyed buffer"),
                },
                GpuCommand::ScatterCopy { src, runs } => {
                    let Some(s) = state.buffers.get(&src) else {
                        tracing::error!(src = src.0, "scatter source destroyed");
                        continue;
                    };
                    for run in runs {
                        match state.buffers.get(&run.dst) {
                            Some(d) => encoder.copy_buffer_to_buffer(
                                &s.buffer,
                                run.src_offset,
                                &d.buffer,
                                run.dst_offset,
                                run.size,
                            ),
                            None => tracing::error!(dst = run.dst.0, "scatter destination destroyed"),
                        }
                    }
                }
                GpuCommand::BindTile { image, tile, heap } => {
                    tracing::trace!(image = image.0, level = tile.level, x = tile.x, y = tile.y, bound = heap.is_some(), "tile binding");
                }
                GpuCommand::CopyToTile {
                    src,
                    src_offset,
                    image,
                    tile,
                } => self.write_tile(&state, src, src_offset, image, tile),
                GpuCommand::BuildAccel { accel, count, mode, .. } => {
                    if let Some(n) = state.accels.get_mut(&accel) {
                        *n = count;
                    }
                    tracing::trace!(accel = accel.0, count, ?mode, "acceleration structure build (emulated)");
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));

        let slot = queue.slot();
        state.submitted[slot] += 1;
        let value = state.submitted[slot];

        let completed = self.completed.clone();
        self.queue.on_submitted_work_done(move || {
            completed[slot].fetch_max(value, Ordering::AcqRel);
        });

        value
    }

    fn completed_fence(&self, queue: QueueKind) -> FenceValue {
        self.device.poll(wgpu::Maintain::Poll);
        self.completed[queue.slot()].load(Ordering::Acquire)
    }

    fn wait_fence(&self, queue: QueueKind, value: FenceValue) {
        while self.completed[queue.slot()].load(Ordering::Acquire) < value {
            let result = self.device.poll(wgpu::Maintain::Wait);
            if result.is_queue_empty() && self.completed[queue.slot()].load(Ordering::Acquire) < value {
                tracing::warn!(value, "queue drained without signalling the awaited fence");
                break;
            }
        }
    }
}
