//! Fence-gated deferred destruction.
//!
//! Values move into the queue and are only reclaimed once the graphics queue has
//! signalled their gate. An entry is either *ungated* (waiting for the next commit
//! to tell it which fence to wait for) or *gated* (waiting for a known fence).
//! Nothing outside the queue can reach a value after it was enqueued.

use crate::device::{AccelHandle, BufferHandle, FenceValue, GpuDevice, HeapHandle, ImageHandle};
use std::sync::Arc;

/// Something that can be destroyed once the GPU no longer reads it.
pub trait Reclaim: Send {
    fn reclaim(self: Box<Self>, device: &dyn GpuDevice);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuResource {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Heap(HeapHandle),
    Accel(AccelHandle),
}

impl GpuResource {
    pub fn release(self, device: &dyn GpuDevice) {
        match self {
            GpuResource::Buffer(b) => device.destroy_buffer(b),
            GpuResource::Image(i) => device.destroy_image(i),
            GpuResource::Heap(h) => device.free_heap(h),
            GpuResource::Accel(a) => device.destroy_accel(a),
        }
    }
}

impl Reclaim for GpuResource {
    fn reclaim(self: Box<Self>, device: &dyn GpuDevice) {
        self.release(device);
    }
}

/// Host-side cleanup run after the gate, e.g. dropping a CPU mirror the GPU copy reads from.
pub struct HostReclaim<F>(pub F);

impl<F: FnOnce() + Send> Reclaim for HostReclaim<F> {
    fn reclaim(self: Box<Self>, _device: &dyn GpuDevice) {
        (self.0)()
    }
}

struct Gated {
    gate: FenceValue,
    value: Box<dyn Reclaim>,
}

pub struct DisposeQueue {
    device: Arc<dyn GpuDevice>,
    ungated: Vec<Box<dyn Reclaim>>,
    gated: Vec<Gated>,
    last_submitted: FenceValue,
    reclaimed: u64,
}

impl DisposeQueue {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            ungated: Vec::new(),
            gated: Vec::new(),
            last_submitted: 0,
            reclaimed: 0,
        }
    }

    /// Reclaims `value` once everything submitted so far has completed.
    pub fn dispose_after_sync(&mut self, value: impl Reclaim + 'static) {
        let gate = self.last_submitted;
        self.dispose_at(value, gate);
    }

    /// Reclaims `value` once the next commit (the frame being recorded) has completed.
    pub fn dispose_after_commit(&mut self, value: impl Reclaim + 'static) {
        self.ungated.push(Box::new(value));
    }

    pub fn dispose_at(&mut self, value: impl Reclaim + 'static, gate: FenceValue) {
        self.gated.push(Gated {
            gate,
            value: Box::new(value),
        });
    }

    pub fn dispose_host_after_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.dispose_after_commit(HostReclaim(f));
    }

    /// Called with the fence of a submission; gates everything waiting for a commit.
    pub fn on_commit(&mut self, fence: FenceValue) {
        self.last_submitted = self.last_submitted.max(fence);
        for value in self.ungated.drain(..) {
            self.gated.push(Gated { gate: fence, value });
        }
    }

    /// Reclaims every entry whose gate is `<= completed`. Returns how many were reclaimed.
    pub fn drain(&mut self, completed: FenceValue) -> usize {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.gated.len() {
            if self.gated[i].gate <= completed {
                ready.push(self.gated.swap_remove(i));
            } else {
                i += 1;
            }
        }

        // swap_remove scrambles order; reclaim in gate order.
        ready.sort_by_key(|g| g.gate);
        let n = ready.len();
        for g in ready {
            g.value.reclaim(self.device.as_ref());
        }

        self.reclaimed += n as u64;
        if n > 0 {
            tracing::trace!(reclaimed = n, completed, pending = self.gated.len(), "dispose queue drained");
        }
        n
    }

    /// Reclaims everything. The caller must have waited for the GPU to go idle.
    pub fn flush_all(&mut self) -> usize {
        let mut n = 0;
        for value in self.ungated.drain(..) {
            value.reclaim(self.device.as_ref());
            n += 1;
        }
        for g in std::mem::take(&mut self.gated) {
            g.value.reclaim(self.device.as_ref());
            n += 1;
        }
        self.reclaimed += n as u64;
        n
    }

    #[inline]
    pub fn last_submitted(&self) -> FenceValue {
        self.last_submitted
    }

    pub fn pending(&self) -> usize {
        self.ungated.len() + self.gated.len()
    }

    /// Total number of values reclaimed over the queue's lifetime.
    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed
    }
}

impl Drop for DisposeQueue {
    fn drop(&mut self) {
        if self.pending() > 0 {
            tracing::warn!(pending = self.pending(), "dispose queue dropped with pending values");
        }
    }
}
