use glam::{Affine3A, Vec3};
use scene_stream::device::{GpuCommand, GpuDevice, HostDevice, QueueKind};
use scene_stream::instances::{AccelInstance, InstanceId, MeshRef};
use scene_stream::{EngineConfig, SceneEngine};
use std::sync::Arc;

fn engine(device: &Arc<HostDevice>, capacity: u32) -> SceneEngine {
    let config = EngineConfig {
        initial_instance_capacity: capacity,
        staging_chunk_size: 4096,
        ..EngineConfig::default()
    };
    SceneEngine::new(device.clone(), config).unwrap()
}

fn at(x: f32) -> Affine3A {
    Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))
}

fn rows(t: Affine3A) -> [f32; 12] {
    let m = t.matrix3;
    let w = t.translation;
    [
        m.x_axis.x, m.y_axis.x, m.z_axis.x, w.x, //
        m.x_axis.y, m.y_axis.y, m.z_axis.y, w.y, //
        m.x_axis.z, m.y_axis.z, m.z_axis.z, w.z,
    ]
}

fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn last_transform_at(device: &HostDevice, e: &SceneEngine, slot: usize) -> Vec<f32> {
    let data = device.read_buffer(e.instances().last_transform_buffer()).unwrap();
    floats(&data[slot * 48..slot * 48 + 48])
}

fn instance_at(device: &HostDevice, e: &SceneEngine, slot: usize) -> AccelInstance {
    let data = device.read_buffer(e.instances().instance_buffer()).unwrap();
    let size = std::mem::size_of::<AccelInstance>();
    bytemuck::pod_read_unaligned(&data[slot * size..(slot + 1) * size])
}

fn frame(e: &mut SceneEngine) -> Vec<GpuCommand> {
    let list = e.before_rendering().unwrap();
    let commands = list.commands().to_vec();
    e.submit_frame(list);
    commands
}

fn builds(commands: &[GpuCommand]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, GpuCommand::BuildAccel { .. }))
        .count()
}

#[test]
fn remove_patches_moved_instance() {
    let device = Arc::new(HostDevice::new());
    let mut e = engine(&device, 8);

    let ids: Vec<InstanceId> = (0..5)
        .map(|i| {
            e.emplace_mesh_instance(MeshRef { blas: 100 + i as u64 }, at(i as f32), 0xff, true, &[], i)
                .unwrap()
        })
        .collect();
    assert_eq!(builds(&frame(&mut e)), 1);

    let moved = e.remove_instance(ids[2]).unwrap();
    assert_eq!(moved.key, ids[4]);
    assert_eq!((moved.old_index, moved.new_index), (4, 2));
    assert_eq!(e.instances().slot_of(ids[4]), Some(2));
    assert_eq!(e.instances().get(ids[4]).unwrap().accel_slot, 2);
    assert_eq!(e.instances().id_at(2), Some(ids[4]));
    assert!(e.instances().get(ids[2]).is_none());
    assert!(e.instances().is_dirty());

    let commands = frame(&mut e);
    assert_eq!(builds(&commands), 1);
    assert!(!e.instances().is_dirty());
    assert_eq!(device.accel_instance_count(e.instances().accel()), Some(4));

    let gpu = instance_at(&device, &e, 2);
    assert_eq!(gpu.blas, 104);
    assert_eq!(gpu.custom_index_and_mask & 0x00ff_ffff, 4);
    assert_eq!(gpu.transform, rows(at(4.0)));

    assert_eq!(builds(&frame(&mut e)), 0);
}

#[test]
fn dense_after_random_removals() {
    let device = Arc::new(HostDevice::new());
    let mut e = engine(&device, 4);

    let mut live: Vec<InstanceId> = (0..32)
        .map(|i| {
            e.emplace_mesh_instance(MeshRef { blas: i as u64 }, at(i as f32), 1, false, &[i], i)
                .unwrap()
        })
        .collect();
    frame(&mut e);

    for victim in [0usize, 7, 3, 20, 11, 5] {
        let id = live.swap_remove(victim.min(live.len() - 1));
        e.remove_instance(id);
    }
    frame(&mut e);

    assert_eq!(e.instances().len(), live.len());
    for slot in 0..live.len() as u32 {
        let id = e.instances().id_at(slot).unwrap();
        assert_eq!(e.instances().slot_of(id), Some(slot));
        assert_eq!(e.instances().get(id).unwrap().accel_slot, slot);

        let rec = e.instances().get(id).unwrap();
        let gpu = instance_at(&device, &e, slot as usize);
        assert_eq!(gpu.custom_index_and_mask & 0x00ff_ffff, rec.user_id);
        assert_eq!(gpu.transform, rows(rec.transform));
    }
    assert!(e.instances().id_at(live.len() as u32).is_none());
}

#[test]
fn previous_transform_lags_one_frame() {
    let device = Arc::new(HostDevice::new());
    let mut e = engine(&device, 4);
    let id = e
        .emplace_mesh_instance(MeshRef { blas: 1 }, at(0.0), 0xff, true, &[], 0)
        .unwrap();
    frame(&mut e);
    assert_eq!(last_transform_at(&device, &e, 0), rows(at(0.0)));

    // Moved twice in one frame: previous is the transform at the start of the frame.
    e.set_transform(id, at(1.0), false);
    e.set_transform(id, at(2.0), false);
    frame(&mut e);
    assert_eq!(last_transform_at(&device, &e, 0), rows(at(0.0)));

    e.set_transform(id, at(3.0), false);
    frame(&mut e);
    assert_eq!(last_transform_at(&device, &e, 0), rows(at(2.0)));

    // Not moved: previous catches up so motion is zero.
    frame(&mut e);
    assert_eq!(last_transform_at(&device, &e, 0), rows(at(3.0)));
    assert_eq!(e.instances().get(id).unwrap().last_transform, at(3.0));
}

#[test]
fn superseded_buffers_wait_for_their_frame() {
    let device = Arc::new(HostDevice::manual());
    let mut e = engine(&device, 2);

    for i in 0..2 {
        e.emplace_mesh_instance(MeshRef { blas: 1 }, at(i as f32), 1, true, &[], i)
            .unwrap();
    }
    frame(&mut e);

    let old = e.instances().instance_buffer();
    e.emplace_mesh_instance(MeshRef { blas: 1 }, at(2.0), 1, true, &[], 2)
        .unwrap();
    assert_ne!(e.instances().instance_buffer(), old);
    let grown_in = frame(&mut e);
    assert!(grown_in
        .iter()
        .any(|c| matches!(c, GpuCommand::CopyBuffer { src, .. } if *src == old)));

    // The frame that copied out of `old` has not completed yet.
    device.signal(QueueKind::Graphics, 1);
    frame(&mut e);
    assert!(device.read_buffer(old).is_some());

    let growth_fence = device.completed_fence(QueueKind::Graphics) + 1;
    device.signal(QueueKind::Graphics, growth_fence);
    frame(&mut e);
    assert!(device.read_buffer(old).is_none());
}

#[test]
fn dropping_engine_releases_everything() {
    let device = Arc::new(HostDevice::manual());
    {
        let mut e = engine(&device, 2);
        for i in 0..5 {
            e.emplace_mesh_instance(MeshRef { blas: 1 }, at(i as f32), 1, true, &[], i)
                .unwrap();
        }
        frame(&mut e);
        frame(&mut e);
    }
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_heaps(), 0);
    assert_eq!(device.live_images(), 0);
}
