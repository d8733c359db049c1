//! Backend-neutral GPU surface used by every engine component.
//!
//! Components never talk to a graphics API directly. They allocate resources through
//! [`GpuDevice`] and record [`GpuCommand`]s into a [`CommandList`], which a backend
//! executes on `submit`. Each queue signals a monotonically increasing fence value.

pub mod host;
#[cfg(feature = "wgpu")]
pub mod wgpu_backend;

use crate::error::Result;
use crate::residency::TileCoordinate;
use vtpack::PackDesc;

pub use self::host::{HostDevice, HostStats};
#[cfg(feature = "wgpu")]
pub use self::wgpu_backend::WgpuDevice;

/// Value signalled by a queue when a submission completes.
pub type FenceValue = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(pub u64);

/// Physical memory backing exactly one sparse tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccelHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Render/record queue owned by the frame loop.
    Graphics,
    /// Secondary queue used by the streaming thread.
    Copy,
}

impl QueueKind {
    #[inline]
    pub(crate) fn slot(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Copy => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Host-visible memory, filled with `write_buffer`, used as a copy source.
    Upload,
    /// Device-local storage, written only by copies.
    Storage,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// One contiguous piece of a scatter copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRun {
    pub dst: BufferHandle,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelBuildMode {
    /// Full rebuild; required after instances were added or removed.
    Build,
    /// Refit in place; instance count and order are unchanged.
    Refit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    /// Many small copies out of one staging source, issued as a single dispatch.
    ScatterCopy { src: BufferHandle, runs: Vec<CopyRun> },
    /// Maps (`Some`) or unmaps (`None`) the physical memory of one sparse tile.
    BindTile {
        image: ImageHandle,
        tile: TileCoordinate,
        heap: Option<HeapHandle>,
    },
    /// Copies one full tile (`PackDesc::tile_bytes`) from a staging buffer into a bound tile.
    CopyToTile {
        src: BufferHandle,
        src_offset: u64,
        image: ImageHandle,
        tile: TileCoordinate,
    },
    BuildAccel {
        accel: AccelHandle,
        instances: BufferHandle,
        count: u32,
        mode: AccelBuildMode,
    },
}

/// Ordered commands for one submission.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandList {
    commands: Vec<GpuCommand>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }

    pub fn append(&mut self, other: &mut CommandList) {
        self.commands.append(&mut other.commands);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GpuCommand> {
        self.commands.iter()
    }
}

impl IntoIterator for CommandList {
    type Item = GpuCommand;
    type IntoIter = std::vec::IntoIter<GpuCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// A GPU the engine can drive. Shared between the owner and the streaming thread.
pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Fills host-visible memory. Only valid for `BufferUsage::Upload` buffers.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]);

    fn create_sparse_image(&self, desc: &PackDesc) -> Result<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);

    fn allocate_heap(&self, size: u64) -> Result<HeapHandle>;
    fn free_heap(&self, heap: HeapHandle);

    fn create_accel(&self) -> Result<AccelHandle>;
    fn destroy_accel(&self, accel: AccelHandle);

    /// Executes `commands` on `queue` and returns the fence value it will signal.
    fn submit(&self, queue: QueueKind, commands: CommandList) -> FenceValue;

    /// Highest fence value the queue has signalled so far. Never blocks.
    fn completed_fence(&self, queue: QueueKind) -> FenceValue;

    /// Blocks until `queue` signalled `value`. Only used at shutdown.
    fn wait_fence(&self, queue: QueueKind, value: FenceValue);
}
