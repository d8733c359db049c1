//! Bump allocation of host-visible upload memory.
//!
//! Regions are handed out from a list of chunks and are valid until the next
//! `reset`. Each chunk keeps a host shadow that `flush` pushes to the device; the
//! region's bytes are only visible to GPU copies recorded after that flush.

use crate::device::{BufferDesc, BufferHandle, BufferUsage, GpuDevice};
use crate::dispose::{DisposeQueue, GpuResource};
use crate::error::Result;
use std::sync::Arc;

/// A slice of one staging chunk, owned by the caller until the allocator is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingRegion {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub len: u64,
    chunk: usize,
}

struct Chunk {
    buffer: BufferHandle,
    shadow: Vec<u8>,
    head: u64,
    flushed: u64,
}

impl Chunk {
    #[inline]
    fn size(&self) -> u64 {
        self.shadow.len() as u64
    }
}

#[inline]
fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

pub struct StagingAllocator {
    device: Arc<dyn GpuDevice>,
    label: &'static str,
    chunk_size: u64,
    chunks: Vec<Chunk>,
    current: usize,
    allocated: u64,
}

impl StagingAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, label: &'static str, chunk_size: u64) -> Self {
        Self {
            device,
            label,
            chunk_size: chunk_size.max(256),
            chunks: Vec::new(),
            current: 0,
            allocated: 0,
        }
    }

    /// Bump-allocates `size` bytes. Grows the pool instead of failing; only device OOM is an error.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<StagingRegion> {
        let align = align.max(4);

        while self.current < self.chunks.len() {
            let chunk = &mut self.chunks[self.current];
            let offset = align_up(chunk.head, align);
            if offset + size <= chunk.size() {
                chunk.head = offset + size;
                self.allocated += size;
                return Ok(StagingRegion {
                    buffer: chunk.buffer,
                    offset,
                    len: size,
                    chunk: self.current,
                });
            }
            self.current += 1;
        }

        let chunk_size = align_up(self.chunk_size.max(size), 4);
        let buffer = self.device.create_buffer(&BufferDesc {
            label: self.label,
            size: chunk_size,
            usage: BufferUsage::Upload,
        })?;
        tracing::debug!(label = self.label, chunk_size, chunks = self.chunks.len() + 1, "staging pool grew");

        self.chunks.push(Chunk {
            buffer,
            shadow: vec![0u8; chunk_size as usize],
            head: size,
            flushed: 0,
        });
        self.current = self.chunks.len() - 1;
        self.allocated += size;

        Ok(StagingRegion {
            buffer,
            offset: 0,
            len: size,
            chunk: self.current,
        })
    }

    /// Mutable host view of `region`.
    pub fn region_mut(&mut self, region: &StagingRegion) -> &mut [u8] {
        let start = region.offset as usize;
        &mut self.chunks[region.chunk].shadow[start..start + region.len as usize]
    }

    /// Copies `bytes` to the start of `region`.
    pub fn write(&mut self, region: &StagingRegion, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 <= region.len);
        self.region_mut(region)[..bytes.len()].copy_from_slice(bytes);
    }

    /// Pushes everything written since the last flush to the device.
    pub fn flush(&mut self) {
        for chunk in &mut self.chunks {
            let end = align_up(chunk.head, 4).min(chunk.size());
            if end > chunk.flushed {
                let start = chunk.flushed & !3;
                self.device
                    .write_buffer(chunk.buffer, start, &chunk.shadow[start as usize..end as usize]);
                chunk.flushed = end;
            }
        }
    }

    /// Invalidates every region. If the pool grew past one chunk, the chunks are
    /// handed to `dispose` and the next allocation creates one chunk large enough
    /// for the whole previous cycle.
    pub fn reset(&mut self, dispose: &mut DisposeQueue) {
        self.reset_with(|buffer| dispose.dispose_after_sync(GpuResource::Buffer(buffer)));
    }

    /// Like `reset`, but destroys superseded chunks immediately. Only valid when
    /// every copy reading from this allocator is known to have completed.
    pub fn reset_synced(&mut self) {
        let device = self.device.clone();
        self.reset_with(|buffer| device.destroy_buffer(buffer));
    }

    fn reset_with(&mut self, mut retire: impl FnMut(BufferHandle)) {
        if self.chunks.len() > 1 {
            let total: u64 = self.chunks.iter().map(Chunk::size).sum();
            for chunk in self.chunks.drain(..) {
                retire(chunk.buffer);
            }
            self.chunk_size = self.chunk_size.max(total);
        } else if let Some(chunk) = self.chunks.first_mut() {
            chunk.head = 0;
            chunk.flushed = 0;
        }

        self.current = 0;
        self.allocated = 0;
    }

    /// Gives up every chunk, e.g. when the frame that used them cannot be waited for.
    pub fn retire(&mut self, dispose: &mut DisposeQueue) {
        for chunk in self.chunks.drain(..) {
            dispose.dispose_after_sync(GpuResource::Buffer(chunk.buffer));
        }
        self.current = 0;
        self.allocated = 0;
    }

    /// Destroys every chunk. The caller must have waited for the GPU.
    pub fn destroy(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.device.destroy_buffer(chunk.buffer);
        }
        self.current = 0;
        self.allocated = 0;
    }

    /// Bytes handed out since the last reset.
    #[inline]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn capacity(&self) -> u64 {
        self.chunks.iter().map(Chunk::size).sum()
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn bump_allocation_respects_alignment() {
        let device = Arc::new(HostDevice::new());
        let mut s = StagingAllocator::new(device, "test staging", 1024);

        let a = s.allocate(10, 4).unwrap();
        let b = s.allocate(16, 16).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 16);
        assert_eq!(a.buffer, b.buffer);
        assert_eq!(s.allocated(), 26);
    }

    #[test]
    fn grows_and_consolidates_on_reset() {
        let device = Arc::new(HostDevice::new());
        let mut dispose = DisposeQueue::new(device.clone());
        let mut s = StagingAllocator::new(device.clone(), "test staging", 256);

        s.allocate(200, 4).unwrap();
        let big = s.allocate(1000, 4).unwrap();
        assert_eq!(big.offset, 0);
        assert_eq!(s.chunk_count(), 2);

        s.reset(&mut dispose);
        assert_eq!(s.chunk_count(), 0);
        assert_eq!(dispose.pending(), 2);
        dispose.drain(0);
        assert_eq!(device.live_buffers(), 0);

        let r = s.allocate(1200, 4).unwrap();
        assert_eq!(s.chunk_count(), 1);
        assert!(s.capacity() >= 1256);
        assert_eq!(r.offset, 0);
    }

    #[test]
    fn single_chunk_is_reused() {
        let device = Arc::new(HostDevice::new());
        let mut dispose = DisposeQueue::new(device.clone());
        let mut s = StagingAllocator::new(device.clone(), "test staging", 256);

        let first = s.allocate(64, 4).unwrap();
        s.reset(&mut dispose);
        let again = s.allocate(64, 4).unwrap();
        assert_eq!(first, again);
        assert_eq!(dispose.pending(), 0);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn flush_makes_writes_visible() {
        let device = Arc::new(HostDevice::new());
        let mut s = StagingAllocator::new(device.clone(), "test staging", 256);

        let r = s.allocate(6, 4).unwrap();
        s.write(&r, &[1, 2, 3, 4, 5, 6]);
        s.flush();

        let data = device.read_buffer(r.buffer).unwrap();
        assert_eq!(&data[..6], &[1, 2, 3, 4, 5, 6]);

        let r2 = s.allocate(4, 4).unwrap();
        s.write(&r2, &[9, 9, 9, 9]);
        s.flush();
        let data = device.read_buffer(r2.buffer).unwrap();
        assert_eq!(&data[8..12], &[9, 9, 9, 9]);
    }
}
