//! Background tile loader.
//!
//! The worker reads tiles, allocates their heaps, and records bind + copy commands
//! on the copy queue. It reports each tile through the completion channel together
//! with the copy fence; the owner makes the tile resident only once that fence has
//! passed. A failed tile releases its processing counter here, so the tile can be
//! requested again.

use super::{SharedImage, TexId};
use crate::device::{CommandList, FenceValue, GpuCommand, GpuDevice, HeapHandle, QueueKind};
use crate::residency::TileCoordinate;
use crate::staging::StagingAllocator;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) struct LoadRequest {
    pub image: Arc<SharedImage>,
    pub coord: TileCoordinate,
    pub index: usize,
}

pub(crate) enum WorkerMsg {
    Load(LoadRequest),
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Completion {
    Loaded {
        image: TexId,
        coord: TileCoordinate,
        index: usize,
        heap: HeapHandle,
        fence: FenceValue,
    },
    Failed {
        image: TexId,
        coord: TileCoordinate,
    },
}

pub(crate) struct Worker {
    pub tx: Sender<WorkerMsg>,
    pub join: JoinHandle<()>,
}

impl Worker {
    pub fn spawn(
        device: Arc<dyn GpuDevice>,
        done: Sender<Completion>,
        batch: usize,
        staging_chunk: u64,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let join = std::thread::Builder::new()
            .name("tile-streamer".into())
            .spawn(move || run(device, rx, done, batch.max(1), staging_chunk))?;

        tracing::info!("tile streaming thread started");
        Ok(Self { tx, join })
    }

    /// Stops the thread after it finished every queued request.
    pub fn shutdown(self) {
        if self.tx.send(WorkerMsg::Shutdown).is_err() {
            tracing::debug!("tile streaming thread already exited");
        }
        if self.join.join().is_err() {
            tracing::error!("tile streaming thread panicked");
        }
    }
}

/// Staging allocators whose copies may still be executing, oldest first.
struct StagingRing {
    device: Arc<dyn GpuDevice>,
    chunk: u64,
    free: Vec<StagingAllocator>,
    in_flight: VecDeque<(FenceValue, StagingAllocator)>,
}

impl StagingRing {
    fn acquire(&mut self) -> StagingAllocator {
        let completed = self.device.completed_fence(QueueKind::Copy);
        while self.in_flight.front().is_some_and(|(fence, _)| *fence <= completed) {
            if let Some((_, mut staging)) = self.in_flight.pop_front() {
                staging.reset_synced();
                self.free.push(staging);
            }
        }

        self.free
            .pop()
            .unwrap_or_else(|| StagingAllocator::new(self.device.clone(), "tile staging", self.chunk))
    }

    fn release(&mut self, staging: StagingAllocator, fence: Option<FenceValue>) {
        match fence {
            Some(fence) => self.in_flight.push_back((fence, staging)),
            None => self.free.push(staging),
        }
    }

    fn destroy(&mut self) {
        if let Some(&(last, _)) = self.in_flight.back() {
            self.device.wait_fence(QueueKind::Copy, last);
        }
        for (_, mut staging) in self.in_flight.drain(..) {
            staging.destroy();
        }
        for mut staging in self.free.drain(..) {
            staging.destroy();
        }
    }
}

fn run(
    device: Arc<dyn GpuDevice>,
    rx: Receiver<WorkerMsg>,
    done: Sender<Completion>,
    batch: usize,
    staging_chunk: u64,
) {
    let mut ring = StagingRing {
        device: device.clone(),
        chunk: staging_chunk,
        free: Vec::new(),
        in_flight: VecDeque::new(),
    };
    let mut requests = Vec::with_capacity(batch);
    let mut running = true;

    while running {
        match rx.recv() {
            Ok(WorkerMsg::Load(req)) => requests.push(req),
            Ok(WorkerMsg::Shutdown) | Err(_) => break,
        }

        while requests.len() < batch {
            match rx.try_recv() {
                Ok(WorkerMsg::Load(req)) => requests.push(req),
                Ok(WorkerMsg::Shutdown) | Err(TryRecvError::Disconnected) => {
                    running = false;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let mut staging = ring.acquire();
        let fence = load_batch(device.as_ref(), &mut staging, &done, requests.drain(..));
        ring.release(staging, fence);
    }

    ring.destroy();
    tracing::info!("tile streaming thread stopped");
}

fn fail(req: &LoadRequest, done: &Sender<Completion>) {
    req.image.processing.end(req.index);
    if done
        .send(Completion::Failed {
            image: req.image.id,
            coord: req.coord,
        })
        .is_err()
    {
        tracing::debug!(tex = req.image.id.0, "completion channel closed; failure not reported");
    }
}

fn load_batch(
    device: &dyn GpuDevice,
    staging: &mut StagingAllocator,
    done: &Sender<Completion>,
    requests: impl Iterator<Item = LoadRequest>,
) -> Option<FenceValue> {
    let mut list = CommandList::new();
    let mut loaded: Vec<(TexId, TileCoordinate, usize, HeapHandle)> = Vec::new();

    for req in requests {
        let desc = &req.image.desc;
        let tile_bytes = desc.tile_bytes() as u64;

        let region = match staging.allocate(tile_bytes, 16) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "staging allocation for tile failed");
                fail(&req, done);
                continue;
            }
        };

        if let Err(e) = req.image.source.read_tile(req.coord, staging.region_mut(&region)) {
            tracing::warn!(
                tex = req.image.id.0,
                level = req.coord.level,
                x = req.coord.x,
                y = req.coord.y,
                error = %e,
                "tile read failed"
            );
            fail(&req, done);
            continue;
        }

        let heap = match device.allocate_heap(tile_bytes) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(tex = req.image.id.0, error = %e, "tile heap allocation failed");
                fail(&req, done);
                continue;
            }
        };

        list.push(GpuCommand::BindTile {
            image: req.image.image,
            tile: req.coord,
            heap: Some(heap),
        });
        list.push(GpuCommand::CopyToTile {
            src: region.buffer,
            src_offset: region.offset,
            image: req.image.image,
            tile: req.coord,
        });
        loaded.push((req.image.id, req.coord, req.index, heap));
    }

    if loaded.is_empty() {
        staging.reset_synced();
        return None;
    }

    staging.flush();
    let fence = device.submit(QueueKind::Copy, list);
    tracing::trace!(tiles = loaded.len(), fence, "tile copies submitted");

    for (image, coord, index, heap) in loaded {
        let sent = done.send(Completion::Loaded {
            image,
            coord,
            index,
            heap,
            fence,
        });
        if let Err(err) = sent {
            tracing::debug!(tex = image.0, "completion channel closed; freeing tile heap");
            if let Completion::Loaded { heap, .. } = err.0 {
                device.wait_fence(QueueKind::Copy, fence);
                device.free_heap(heap);
            }
        }
    }

    Some(fence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostDevice;
    use crate::residency::ProcessingCounters;
    use crate::streaming::TileSourceDesc;
    use vtpack::{PackDesc, TexelFormat};

    fn image(device: &HostDevice) -> Arc<SharedImage> {
        let desc = PackDesc {
            width: 8,
            height: 8,
            mip_levels: 1,
            format: TexelFormat::R8,
            tile_width: 4,
            tile_height: 4,
        };
        let source = TileSourceDesc::callback(desc, |_, out| {
            out.fill(1);
            Ok(())
        })
        .open()
        .unwrap();

        Arc::new(SharedImage {
            id: TexId(0),
            image: device.create_sparse_image(&desc).unwrap(),
            desc,
            source,
            processing: Arc::new(ProcessingCounters::new(desc.tile_count())),
        })
    }

    #[test]
    fn loads_report_fence_and_heap() {
        let device = Arc::new(HostDevice::new());
        let shared = image(&device);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let worker = Worker::spawn(device.clone(), done_tx, 4, 1024).unwrap();

        for index in 0..2 {
            assert!(shared.processing.try_begin(index));
            let coord = TileCoordinate::new(index as u32, 0, 0);
            worker
                .tx
                .send(WorkerMsg::Load(LoadRequest { image: shared.clone(), coord, index }))
                .unwrap();
        }
        worker.shutdown();

        let done: Vec<Completion> = done_rx.try_iter().collect();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| matches!(c, Completion::Loaded { fence, .. } if *fence >= 1)));
        assert_eq!(device.live_heaps(), 2);
        assert_eq!(device.bound_tiles(shared.image), 2);
    }

    #[test]
    fn closed_completion_channel_frees_heaps() {
        let device = Arc::new(HostDevice::new());
        let shared = image(&device);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        drop(done_rx);
        let worker = Worker::spawn(device.clone(), done_tx, 4, 1024).unwrap();

        assert!(shared.processing.try_begin(0));
        worker
            .tx
            .send(WorkerMsg::Load(LoadRequest {
                image: shared.clone(),
                coord: TileCoordinate::new(0, 0, 0),
                index: 0,
            }))
            .unwrap();
        worker.shutdown();

        assert_eq!(device.live_heaps(), 0);
    }
}
