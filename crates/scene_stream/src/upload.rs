//! Coalescing of element-sized writes into batched scatter copies.
//!
//! Writes are grouped by element layout (size, alignment). At commit time each
//! group is packed into one staging region and turned into one `ScatterCopy`,
//! with runs of consecutive indices of the same destination merged.

use crate::device::{BufferDesc, BufferHandle, BufferUsage, CommandList, CopyRun, GpuCommand, GpuDevice};
use crate::dispose::{DisposeQueue, GpuResource};
use crate::error::Result;
use crate::staging::StagingAllocator;
use bytemuck::Pod;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayoutKey {
    pub stride: u32,
    pub align: u32,
}

impl LayoutKey {
    #[inline]
    pub fn of<T>() -> Self {
        Self {
            stride: std::mem::size_of::<T>() as u32,
            align: std::mem::align_of::<T>() as u32,
        }
    }
}

type Element = SmallVec<[u8; 64]>;

/// Staged writes of one layout: destination -> index -> element bytes.
type Group = BTreeMap<BufferHandle, BTreeMap<u32, Element>>;

#[derive(Default)]
pub struct UploadBatcher {
    groups: BTreeMap<LayoutKey, Group>,
    committed_bytes: u64,
}

impl UploadBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `data[i]` for element `first_index + i` of `dst`. A later write to the
    /// same element replaces the earlier one.
    pub fn stage_write<T: Pod>(&mut self, dst: BufferHandle, first_index: u32, data: &[T]) {
        if data.is_empty() {
            return;
        }

        let entries = self
            .groups
            .entry(LayoutKey::of::<T>())
            .or_default()
            .entry(dst)
            .or_default();

        for (i, v) in data.iter().enumerate() {
            entries.insert(first_index + i as u32, SmallVec::from_slice(bytemuck::bytes_of(v)));
        }
    }

    /// Re-targets every staged, uncommitted write from `old` to `new`.
    /// Writes already staged for `new` win over those moved from `old`.
    pub fn swap_buffer(&mut self, old: BufferHandle, new: BufferHandle) {
        for group in self.groups.values_mut() {
            let Some(moved) = group.remove(&old) else {
                continue;
            };
            let target = group.entry(new).or_default();
            for (index, bytes) in moved {
                target.entry(index).or_insert(bytes);
            }
        }
    }

    /// Records one scatter copy per layout group. Returns whether anything was recorded.
    pub fn commit(&mut self, list: &mut CommandList, staging: &mut StagingAllocator) -> Result<bool> {
        let mut recorded = false;

        for (key, group) in std::mem::take(&mut self.groups) {
            let count: usize = group.values().map(BTreeMap::len).sum();
            if count == 0 {
                continue;
            }

            let stride = key.stride as u64;
            let region = staging.allocate(count as u64 * stride, key.align as u64)?;
            let mut runs: Vec<CopyRun> = Vec::new();
            let mut cursor = 0u64;

            {
                let host = staging.region_mut(&region);
                for (&dst, entries) in &group {
                    let mut prev: Option<u32> = None;
                    for (&index, bytes) in entries {
                        let at = cursor as usize;
                        host[at..at + bytes.len()].copy_from_slice(bytes);

                        let src_offset = region.offset + cursor;
                        let dst_offset = index as u64 * stride;
                        let extends = prev.is_some_and(|p| p + 1 == index);
                        match runs.last_mut() {
                            Some(run) if extends => run.size += stride,
                            _ => runs.push(CopyRun {
                                dst,
                                src_offset,
                                dst_offset,
                                size: stride,
                            }),
                        }

                        prev = Some(index);
                        cursor += stride;
                    }
                }
            }

            tracing::trace!(stride = key.stride, elements = count, runs = runs.len(), "upload group committed");
            self.committed_bytes += cursor;
            list.push(GpuCommand::ScatterCopy {
                src: region.buffer,
                runs,
            });
            recorded = true;
        }

        Ok(recorded)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(|g| g.values().all(BTreeMap::is_empty))
    }

    /// Number of staged elements across all groups.
    pub fn pending_elements(&self) -> usize {
        self.groups
            .values()
            .flat_map(|g| g.values())
            .map(BTreeMap::len)
            .sum()
    }

    /// Bytes packed into staging by every commit so far.
    #[inline]
    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes
    }
}

/// A device-local array of `T` that grows by doubling.
///
/// Growth records a copy of the live prefix into the new buffer and re-targets
/// staged writes; `flush` must run before the batcher's commit so the copy lands
/// first. The old buffer is disposed after that commit.
pub struct DeviceArray<T: Pod> {
    label: &'static str,
    buffer: BufferHandle,
    capacity: u32,
    pending: CommandList,
    retired: Vec<BufferHandle>,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceArray<T> {
    pub fn new(device: &dyn GpuDevice, label: &'static str, capacity: u32) -> Result<Self> {
        let capacity = capacity.max(1);
        let buffer = device.create_buffer(&BufferDesc {
            label,
            size: capacity as u64 * std::mem::size_of::<T>() as u64,
            usage: BufferUsage::Storage,
        })?;

        Ok(Self {
            label,
            buffer,
            capacity,
            pending: CommandList::new(),
            retired: Vec::new(),
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn stage(&self, batcher: &mut UploadBatcher, index: u32, data: &[T]) {
        batcher.stage_write(self.buffer, index, data);
    }

    /// Makes room for `needed` elements, preserving the first `live` ones.
    pub fn reserve(
        &mut self,
        device: &dyn GpuDevice,
        batcher: &mut UploadBatcher,
        needed: u32,
        live: u32,
    ) -> Result<()> {
        if needed <= self.capacity {
            return Ok(());
        }

        let mut capacity = self.capacity;
        while capacity < needed {
            capacity = capacity.saturating_mul(2);
        }

        let stride = std::mem::size_of::<T>() as u64;
        let buffer = device.create_buffer(&BufferDesc {
            label: self.label,
            size: capacity as u64 * stride,
            usage: BufferUsage::Storage,
        })?;

        if live > 0 {
            self.pending.push(GpuCommand::CopyBuffer {
                src: self.buffer,
                src_offset: 0,
                dst: buffer,
                dst_offset: 0,
                size: live as u64 * stride,
            });
        }
        batcher.swap_buffer(self.buffer, buffer);
        self.retired.push(self.buffer);

        tracing::debug!(label = self.label, old = self.capacity, new = capacity, "device array grew");
        self.buffer = buffer;
        self.capacity = capacity;
        Ok(())
    }

    /// Moves growth copies into `list` and hands superseded buffers to `dispose`.
    pub fn flush(&mut self, list: &mut CommandList, dispose: &mut DisposeQueue) {
        list.append(&mut self.pending);
        for buffer in self.retired.drain(..) {
            dispose.dispose_after_commit(GpuResource::Buffer(buffer));
        }
    }

    pub fn release(&mut self, dispose: &mut DisposeQueue) {
        self.pending = CommandList::new();
        for buffer in self.retired.drain(..) {
            dispose.dispose_after_commit(GpuResource::Buffer(buffer));
        }
        dispose.dispose_after_commit(GpuResource::Buffer(self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostDevice, QueueKind};
    use std::sync::Arc;

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn storage(device: &HostDevice, size: u64) -> BufferHandle {
        device
            .create_buffer(&BufferDesc {
                label: "dst",
                size,
                usage: BufferUsage::Storage,
            })
            .unwrap()
    }

    #[test]
    fn contiguous_indices_merge_into_one_run() {
        let device = Arc::new(HostDevice::new());
        let dst = storage(&device, 64);
        let mut staging = StagingAllocator::new(device.clone(), "staging", 1024);
        let mut b = UploadBatcher::new();

        b.stage_write(dst, 0, &[1u32, 2]);
        b.stage_write(dst, 2, &[3u32]);
        b.stage_write(dst, 5, &[6u32]);
        b.stage_write(dst, 1, &[20u32]); // overwrites index 1

        let mut list = CommandList::new();
        assert!(b.commit(&mut list, &mut staging).unwrap());
        assert_eq!(list.len(), 1);
        match &list.commands()[0] {
            GpuCommand::ScatterCopy { runs, .. } => {
                assert_eq!(runs.len(), 2);
                assert_eq!((runs[0].dst_offset, runs[0].size), (0, 12));
                assert_eq!((runs[1].dst_offset, runs[1].size), (20, 4));
            }
            other => panic!("unexpected command {other:?}"),
        }

        staging.flush();
        device.submit(QueueKind::Graphics, list);
        let data = words(&device.read_buffer(dst).unwrap());
        assert_eq!(&data[..6], &[1, 20, 3, 0, 0, 6]);
        assert!(b.is_empty());
    }

    #[test]
    fn groups_are_keyed_by_layout() {
        let device = Arc::new(HostDevice::new());
        let a = storage(&device, 64);
        let c = storage(&device, 256);
        let mut staging = StagingAllocator::new(device.clone(), "staging", 1024);
        let mut b = UploadBatcher::new();

        b.stage_write(a, 0, &[1u32]);
        b.stage_write(c, 0, &[[1.0f32; 4]]);
        b.stage_write(c, 3, &[[2.0f32; 4]]);

        let mut list = CommandList::new();
        assert!(b.commit(&mut list, &mut staging).unwrap());
        assert_eq!(list.len(), 2);
        assert_eq!(b.committed_bytes(), 4 + 32);
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let device = Arc::new(HostDevice::new());
        let mut staging = StagingAllocator::new(device, "staging", 1024);
        let mut b = UploadBatcher::new();
        let mut list = CommandList::new();
        assert!(!b.commit(&mut list, &mut staging).unwrap());
        assert!(list.is_empty());
        assert_eq!(staging.chunk_count(), 0);
    }

    #[test]
    fn swap_buffer_retargets_pending_writes() {
        let device = Arc::new(HostDevice::new());
        let old = storage(&device, 16);
        let new = storage(&device, 32);
        let mut staging = StagingAllocator::new(device.clone(), "staging", 1024);
        let mut b = UploadBatcher::new();

        b.stage_write(old, 1, &[7u32]);
        b.stage_write(new, 1, &[8u32]);
        b.stage_write(old, 2, &[9u32]);
        b.swap_buffer(old, new);

        let mut list = CommandList::new();
        b.commit(&mut list, &mut staging).unwrap();
        staging.flush();
        device.submit(QueueKind::Graphics, list);

        let data = words(&device.read_buffer(new).unwrap());
        assert_eq!(&data[..3], &[0, 8, 9]);
        let untouched = words(&device.read_buffer(old).unwrap());
        assert_eq!(untouched, vec![0; 4]);
    }

    #[test]
    fn device_array_growth_preserves_contents() {
        let device = Arc::new(HostDevice::new());
        let mut dispose = DisposeQueue::new(device.clone());
        let mut staging = StagingAllocator::new(device.clone(), "staging", 1024);
        let mut b = UploadBatcher::new();
        let mut arr = DeviceArray::<u32>::new(device.as_ref(), "arr", 2).unwrap();

        arr.stage(&mut b, 0, &[10, 11]);
        let mut list = CommandList::new();
        b.commit(&mut list, &mut staging).unwrap();
        staging.flush();
        let fence = device.submit(QueueKind::Graphics, list);
        dispose.on_commit(fence);

        let old = arr.buffer();
        arr.reserve(device.as_ref(), &mut b, 3, 2).unwrap();
        assert_eq!(arr.capacity(), 4);
        arr.stage(&mut b, 2, &[12]);

        let mut list = CommandList::new();
        arr.flush(&mut list, &mut dispose);
        b.commit(&mut list, &mut staging).unwrap();
        staging.flush();
        let fence = device.submit(QueueKind::Graphics, list);
        dispose.on_commit(fence);
        dispose.drain(fence);

        let data = words(&device.read_buffer(arr.buffer()).unwrap());
        assert_eq!(&data[..3], &[10, 11, 12]);
        assert!(device.read_buffer(old).is_none());
    }
}
