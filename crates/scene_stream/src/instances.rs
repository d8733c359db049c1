//! Ray-tracing instance table.
//!
//! Instances are kept dense so the acceleration structure's instance array can be
//! built straight from the device buffer. Each record remembers its slot in that
//! array (`accel_slot`); a swap-remove patches the moved record's slot and restages
//! its data before returning.
//!
//! The previous-frame transform buffer lags exactly one frame behind the current one:
//! the first `set_transform` of a frame saves the old transform, and the frame-boundary
//! sweep copies the current transform over for instances that stopped moving.

use crate::device::{AccelBuildMode, AccelHandle, BufferHandle, CommandList, GpuCommand, GpuDevice};
use crate::dispose::{DisposeQueue, GpuResource};
use crate::error::Result;
use crate::lights::Aabb;
use crate::table::{IndexedTable, MovedEntry};
use crate::upload::{DeviceArray, UploadBatcher};
use bytemuck::{Pod, Zeroable};
use glam::Affine3A;
use slotmap::new_key_type;
use smallvec::SmallVec;
use std::sync::Arc;

new_key_type! { pub struct InstanceId; }

/// Materials per instance that reach the GPU.
pub const MAX_INSTANCE_MATERIALS: usize = 4;

/// `VK_GEOMETRY_INSTANCE_FORCE_OPAQUE_BIT_KHR`
const INSTANCE_FLAG_FORCE_OPAQUE: u32 = 0x4;
const HIT_GROUP_MESH: u32 = 0;
const HIT_GROUP_PROCEDURAL: u32 = 1;
const NO_MATERIAL: u32 = u32::MAX;

/// Bottom-level geometry of a triangle mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRef {
    /// Device address (or backend id) of the mesh's bottom-level structure.
    pub blas: u64,
}

/// A procedural primitive, intersected by a custom shader inside `aabb`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProceduralPrimitive {
    pub blas: u64,
    pub aabb: Aabb,
    /// Selects the intersection shader.
    pub kind: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Geometry {
    Mesh(MeshRef),
    Procedural(ProceduralPrimitive),
}

impl Geometry {
    fn blas(&self) -> u64 {
        match self {
            Geometry::Mesh(m) => m.blas,
            Geometry::Procedural(p) => p.blas,
        }
    }

    fn hit_group(&self) -> u32 {
        match self {
            Geometry::Mesh(_) => HIT_GROUP_MESH,
            Geometry::Procedural(p) => HIT_GROUP_PROCEDURAL + p.kind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub geometry: Geometry,
    pub transform: Affine3A,
    pub last_transform: Affine3A,
    pub visibility: u8,
    pub opaque: bool,
    pub materials: SmallVec<[u32; MAX_INSTANCE_MATERIALS]>,
    pub user_id: u32,
    /// Index of this instance in the acceleration structure's instance array.
    pub accel_slot: u32,
    changed_frame: u64,
}

/// Acceleration-structure instance, laid out like `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelInstance {
    /// Row-major 3x4 object-to-world matrix.
    pub transform: [f32; 12],
    /// Low 24 bits: user id. High 8 bits: visibility mask.
    pub custom_index_and_mask: u32,
    /// Low 24 bits: hit group offset. High 8 bits: instance flags.
    pub sbt_offset_and_flags: u32,
    pub blas: u64,
}

pub(crate) fn rows(t: &Affine3A) -> [f32; 12] {
    let (x, y, z, w) = (t.matrix3.x_axis, t.matrix3.y_axis, t.matrix3.z_axis, t.translation);
    [
        x.x, y.x, z.x, w.x, //
        x.y, y.y, z.y, w.y, //
        x.z, y.z, z.z, w.z,
    ]
}

impl InstanceRecord {
    pub fn to_gpu(&self) -> AccelInstance {
        let flags = if self.opaque { INSTANCE_FLAG_FORCE_OPAQUE } else { 0 };
        AccelInstance {
            transform: rows(&self.transform),
            custom_index_and_mask: (self.user_id & 0x00ff_ffff) | ((self.visibility as u32) << 24),
            sbt_offset_and_flags: (self.geometry.hit_group() & 0x00ff_ffff) | (flags << 24),
            blas: self.geometry.blas(),
        }
    }

    fn material_slots(&self) -> [u32; MAX_INSTANCE_MATERIALS] {
        let mut out = [NO_MATERIAL; MAX_INSTANCE_MATERIALS];
        for (slot, m) in out.iter_mut().zip(&self.materials) {
            *slot = *m;
        }
        out
    }
}

pub struct InstanceTable {
    device: Arc<dyn GpuDevice>,
    table: IndexedTable<InstanceId, InstanceRecord>,
    accel: AccelHandle,
    instances: DeviceArray<AccelInstance>,
    last_transforms: DeviceArray<[f32; 12]>,
    materials: DeviceArray<[u32; MAX_INSTANCE_MATERIALS]>,
    frame: u64,
    moved_this_frame: Vec<InstanceId>,
    moved_last_frame: Vec<InstanceId>,
    structure_dirty: bool,
    refit_dirty: bool,
}

impl InstanceTable {
    pub fn new(device: Arc<dyn GpuDevice>, capacity: u32) -> Result<Self> {
        let d = device.as_ref();
        let accel = d.create_accel()?;
        let instances = DeviceArray::new(d, "accel instances", capacity)?;
        let last_transforms = DeviceArray::new(d, "last transforms", capacity)?;
        let materials = DeviceArray::new(d, "instance materials", capacity)?;

        Ok(Self {
            device,
            table: IndexedTable::with_capacity(capacity as usize),
            accel,
            instances,
            last_transforms,
            materials,
            frame: 0,
            moved_this_frame: Vec::new(),
            moved_last_frame: Vec::new(),
            structure_dirty: false,
            refit_dirty: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emplace_mesh_instance(
        &mut self,
        batcher: &mut UploadBatcher,
        mesh: MeshRef,
        transform: Affine3A,
        visibility: u8,
        opaque: bool,
        materials: &[u32],
        user_id: u32,
    ) -> Result<InstanceId> {
        if materials.len() > MAX_INSTANCE_MATERIALS {
            tracing::warn!(
                count = materials.len(),
                max = MAX_INSTANCE_MATERIALS,
                "instance materials truncated"
            );
        }
        let materials = materials.iter().take(MAX_INSTANCE_MATERIALS).copied().collect();
        self.emplace(batcher, Geometry::Mesh(mesh), transform, visibility, opaque, materials, user_id)
    }

    pub fn emplace_procedural_instance(
        &mut self,
        batcher: &mut UploadBatcher,
        primitive: ProceduralPrimitive,
        transform: Affine3A,
        visibility: u8,
        user_id: u32,
    ) -> Result<InstanceId> {
        self.emplace(
            batcher,
            Geometry::Procedural(primitive),
            transform,
            visibility,
            false,
            SmallVec::new(),
            user_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emplace(
        &mut self,
        batcher: &mut UploadBatcher,
        geometry: Geometry,
        transform: Affine3A,
        visibility: u8,
        opaque: bool,
        materials: SmallVec<[u32; MAX_INSTANCE_MATERIALS]>,
        user_id: u32,
    ) -> Result<InstanceId> {
        let live = self.table.len() as u32;
        let d = self.device.as_ref();
        self.instances.reserve(d, batcher, live + 1, live)?;
        self.last_transforms.reserve(d, batcher, live + 1, live)?;
        self.materials.reserve(d, batcher, live + 1, live)?;

        let (id, slot) = self.table.emplace(InstanceRecord {
            geometry,
            transform,
            last_transform: transform,
            visibility,
            opaque,
            materials,
            user_id,
            accel_slot: live,
            changed_frame: self.frame,
        });
        debug_assert_eq!(slot, live);

        self.stage_all(batcher, id);
        self.structure_dirty = true;
        Ok(id)
    }

    fn stage_all(&self, batcher: &mut UploadBatcher, id: InstanceId) {
        let Some(rec) = self.table.get(id) else {
            return;
        };
        let slot = rec.accel_slot;
        self.instances.stage(batcher, slot, &[rec.to_gpu()]);
        self.last_transforms.stage(batcher, slot, &[rows(&rec.last_transform)]);
        self.materials.stage(batcher, slot, &[rec.material_slots()]);
    }

    /// Moves the instance. With `reset_last` the previous transform is set to the
    /// new one too, e.g. after a teleport that must not produce motion vectors.
    pub fn set_transform(
        &mut self,
        batcher: &mut UploadBatcher,
        id: InstanceId,
        transform: Affine3A,
        reset_last: bool,
    ) -> bool {
        let frame = self.frame;
        let Some(rec) = self.table.get_mut(id) else {
            debug_assert!(false, "set_transform on unknown instance {id:?}");
            tracing::warn!(?id, "set_transform on unknown instance ignored");
            return false;
        };

        if reset_last {
            rec.last_transform = transform;
        } else if rec.changed_frame != frame {
            rec.last_transform = rec.transform;
        }
        rec.transform = transform;

        if rec.changed_frame != frame {
            rec.changed_frame = frame;
            self.moved_this_frame.push(id);
        }

        let slot = rec.accel_slot;
        let (gpu, last) = (rec.to_gpu(), rows(&rec.last_transform));
        self.instances.stage(batcher, slot, &[gpu]);
        self.last_transforms.stage(batcher, slot, &[last]);
        self.refit_dirty = true;
        true
    }

    pub fn set_visibility(&mut self, batcher: &mut UploadBatcher, id: InstanceId, mask: u8) -> bool {
        self.modify(batcher, id, |rec| rec.visibility = mask)
    }

    pub fn set_opaque(&mut self, batcher: &mut UploadBatcher, id: InstanceId, opaque: bool) -> bool {
        self.modify(batcher, id, |rec| rec.opaque = opaque)
    }

    fn modify(&mut self, batcher: &mut UploadBatcher, id: InstanceId, f: impl FnOnce(&mut InstanceRecord)) -> bool {
        let Some(rec) = self.table.get_mut(id) else {
            debug_assert!(false, "update of unknown instance {id:?}");
            tracing::warn!(?id, "update of unknown instance ignored");
            return false;
        };
        f(rec);
        let (slot, gpu) = (rec.accel_slot, rec.to_gpu());
        self.instances.stage(batcher, slot, &[gpu]);
        self.refit_dirty = true;
        true
    }

    /// Swap-removes the instance and patches the instance that took its slot.
    pub fn remove(&mut self, batcher: &mut UploadBatcher, id: InstanceId) -> Option<MovedEntry<InstanceId>> {
        let Some(removed) = self.table.remove(id) else {
            debug_assert!(false, "removal of unknown instance {id:?}");
            tracing::warn!(?id, "removal of unknown instance ignored");
            return None;
        };
        self.structure_dirty = true;

        let moved = removed.moved?;
        if let Some(rec) = self.table.get_mut(moved.key) {
            rec.accel_slot = moved.new_index;
        }
        self.stage_all(batcher, moved.key);
        Some(moved)
    }

    /// Frame-boundary sweep: instances that moved last frame but not this one get
    /// their previous transform caught up. Call once per frame, before uploads commit.
    pub fn update_last_transform(&mut self, batcher: &mut UploadBatcher) {
        for id in std::mem::take(&mut self.moved_last_frame) {
            let Some(rec) = self.table.get_mut(id) else {
                continue;
            };
            if rec.changed_frame == self.frame {
                continue;
            }
            rec.last_transform = rec.transform;
            let (slot, last) = (rec.accel_slot, rows(&rec.last_transform));
            self.last_transforms.stage(batcher, slot, &[last]);
        }

        self.moved_last_frame = std::mem::take(&mut self.moved_this_frame);
        self.frame += 1;
    }

    /// Moves pending buffer growth copies into `list`.
    pub fn flush(&mut self, list: &mut CommandList, dispose: &mut DisposeQueue) {
        self.instances.flush(list, dispose);
        self.last_transforms.flush(list, dispose);
        self.materials.flush(list, dispose);
    }

    /// Records a build when instances were added or removed, a refit when only
    /// transforms or visibility changed, and nothing otherwise.
    pub fn build(&mut self, list: &mut CommandList) -> bool {
        let mode = if self.structure_dirty {
            AccelBuildMode::Build
        } else if self.refit_dirty {
            AccelBuildMode::Refit
        } else {
            return false;
        };

        list.push(GpuCommand::BuildAccel {
            accel: self.accel,
            instances: self.instances.buffer(),
            count: self.table.len() as u32,
            mode,
        });
        tracing::trace!(?mode, count = self.table.len(), "instance accel build recorded");

        self.structure_dirty = false;
        self.refit_dirty = false;
        true
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.structure_dirty || self.refit_dirty
    }

    pub fn get(&self, id: InstanceId) -> Option<&InstanceRecord> {
        self.table.get(id)
    }

    pub fn slot_of(&self, id: InstanceId) -> Option<u32> {
        self.table.index_of(id)
    }

    pub fn id_at(&self, slot: u32) -> Option<InstanceId> {
        self.table.key_at(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &InstanceRecord)> + '_ {
        self.table.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[inline]
    pub fn accel(&self) -> AccelHandle {
        self.accel
    }

    pub fn instance_buffer(&self) -> BufferHandle {
        self.instances.buffer()
    }

    pub fn last_transform_buffer(&self) -> BufferHandle {
        self.last_transforms.buffer()
    }

    pub fn material_buffer(&self) -> BufferHandle {
        self.materials.buffer()
    }

    pub fn release(&mut self, dispose: &mut DisposeQueue) {
        self.instances.release(dispose);
        self.last_transforms.release(dispose);
        self.materials.release(dispose);
        dispose.dispose_after_commit(GpuResource::Accel(self.accel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use glam::Vec3;

    fn at(x: f32) -> Affine3A {
        Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    fn table() -> (InstanceTable, UploadBatcher) {
        (InstanceTable::new(Arc::new(HostDevice::new()), 4).unwrap(), UploadBatcher::new())
    }

    #[test]
    fn rows_are_row_major() {
        let r = rows(&Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(r, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn gpu_instance_packs_mask_and_flags() {
        let (mut t, mut b) = table();
        let id = t
            .emplace_mesh_instance(&mut b, MeshRef { blas: 0xabc }, at(0.0), 0x0f, true, &[3], 77)
            .unwrap();
        let g = t.get(id).unwrap().to_gpu();
        assert_eq!(g.custom_index_and_mask, 77 | (0x0f << 24));
        assert_eq!(g.sbt_offset_and_flags >> 24, INSTANCE_FLAG_FORCE_OPAQUE);
        assert_eq!(g.blas, 0xabc);
        assert_eq!(t.get(id).unwrap().material_slots(), [3, NO_MATERIAL, NO_MATERIAL, NO_MATERIAL]);
    }

    #[test]
    fn procedural_uses_its_hit_group() {
        let (mut t, mut b) = table();
        let prim = ProceduralPrimitive {
            blas: 5,
            aabb: Aabb::new(Vec3::ZERO, Vec3::ONE),
            kind: 2,
        };
        let id = t.emplace_procedural_instance(&mut b, prim, at(1.0), 0xff, 9).unwrap();
        let rec = t.get(id).unwrap();
        assert!(matches!(rec.geometry, Geometry::Procedural(_)));
        assert_eq!(rec.to_gpu().sbt_offset_and_flags & 0x00ff_ffff, HIT_GROUP_PROCEDURAL + 2);
    }

    #[test]
    fn previous_transform_lags_one_frame() {
        let (mut t, mut b) = table();
        let id = t
            .emplace_mesh_instance(&mut b, MeshRef { blas: 1 }, at(0.0), 0xff, true, &[], 0)
            .unwrap();
        t.update_last_transform(&mut b);

        // frame 1
        t.set_transform(&mut b, id, at(1.0), false);
        t.set_transform(&mut b, id, at(1.5), false);
        assert_eq!(t.get(id).unwrap().last_transform, at(0.0));
        t.update_last_transform(&mut b);

        // frame 2
        t.set_transform(&mut b, id, at(2.0), false);
        assert_eq!(t.get(id).unwrap().last_transform, at(1.5));
        t.update_last_transform(&mut b);

        // frame 3: no change, previous catches up at the boundary
        assert_eq!(t.get(id).unwrap().last_transform, at(1.5));
        t.update_last_transform(&mut b);
        assert_eq!(t.get(id).unwrap().last_transform, at(2.0));
    }

    #[test]
    fn reset_last_suppresses_motion() {
        let (mut t, mut b) = table();
        let id = t
            .emplace_mesh_instance(&mut b, MeshRef { blas: 1 }, at(0.0), 0xff, true, &[], 0)
            .unwrap();
        t.update_last_transform(&mut b);
        t.set_transform(&mut b, id, at(10.0), true);
        assert_eq!(t.get(id).unwrap().last_transform, at(10.0));
    }

    #[test]
    fn build_modes_follow_dirtiness() {
        let (mut t, mut b) = table();
        let mut list = CommandList::new();
        assert!(!t.build(&mut list));

        let id = t
            .emplace_mesh_instance(&mut b, MeshRef { blas: 1 }, at(0.0), 0xff, true, &[], 0)
            .unwrap();
        assert!(t.build(&mut list));
        t.set_visibility(&mut b, id, 0x01);
        assert!(t.build(&mut list));
        assert!(!t.build(&mut list));

        let modes: Vec<_> = list
            .iter()
            .map(|c| match c {
                GpuCommand::BuildAccel { mode, .. } => *mode,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(modes, vec![AccelBuildMode::Build, AccelBuildMode::Refit]);
    }

    #[test]
    fn growth_keeps_slots_dense() {
        let (mut t, mut b) = table();
        let ids: Vec<_> = (0..9)
            .map(|i| {
                t.emplace_mesh_instance(&mut b, MeshRef { blas: i }, at(i as f32), 0xff, false, &[], i as u32)
                    .unwrap()
            })
            .collect();
        for (slot, id) in ids.iter().enumerate() {
            assert_eq!(t.slot_of(*id), Some(slot as u32));
            assert_eq!(t.get(*id).unwrap().accel_slot, slot as u32);
        }
    }
}
