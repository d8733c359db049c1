//! Light clusters and the light BVH.
//!
//! Each light type lives in its own [`LightCluster`]: a swap-compacted host table
//! mirrored into a device array. All five contribute one leaf per light to a shared
//! BVH. Adding or removing a light forces a rebuild; changing a light only refits
//! the path from its leaf to the root.

use crate::device::{CommandList, GpuDevice};
use crate::dispose::DisposeQueue;
use crate::error::Result;
use crate::table::IndexedTable;
use crate::upload::{DeviceArray, UploadBatcher};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use slotmap::new_key_type;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

new_key_type! { pub struct LightKey; }

const BVH_NONE: u32 = u32::MAX;
const LEAF_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn from_center_extent(center: Vec3, half: Vec3) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    #[inline]
    pub fn union(self, other: Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LightType {
    Point = 0,
    Spot = 1,
    Area = 2,
    Disk = 3,
    Mesh = 4,
}

impl LightType {
    pub const ALL: [LightType; 5] = [
        LightType::Point,
        LightType::Spot,
        LightType::Area,
        LightType::Disk,
        LightType::Mesh,
    ];

    fn from_bits(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// A light type that can live in a [`LightCluster`].
pub trait Light: Copy + Send + 'static {
    const TYPE: LightType;
    type Gpu: Pod;

    fn to_gpu(&self) -> Self::Gpu;
    fn bounds(&self) -> Aabb;

    #[doc(hidden)]
    fn cluster(clusters: &LightClusters) -> &LightCluster<Self>;
    #[doc(hidden)]
    fn cluster_mut(clusters: &mut LightClusters) -> &mut LightCluster<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub radius: f32,
    pub radiance: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotLight {
    pub position: Vec3,
    pub direction: Vec3,
    pub radius: f32,
    /// Half-angle of the cone, in radians.
    pub angle: f32,
    pub radiance: Vec3,
}

/// Parallelogram emitter spanned by `u` and `v` around `center`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaLight {
    pub center: Vec3,
    pub u: Vec3,
    pub v: Vec3,
    pub radiance: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskLight {
    pub center: Vec3,
    pub normal: Vec3,
    pub radius: f32,
    pub radiance: Vec3,
}

/// Emissive triangles of a mesh. Bounds are supplied by the mesh owner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshLight {
    pub bounds: Aabb,
    pub mesh: u32,
    pub triangle_offset: u32,
    pub triangle_count: u32,
    pub radiance: Vec3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuPointLight {
    pub position_radius: [f32; 4],
    pub radiance: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuSpotLight {
    pub position_radius: [f32; 4],
    pub direction_cos: [f32; 4],
    pub radiance: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuAreaLight {
    pub center: [f32; 4],
    pub u: [f32; 4],
    pub v: [f32; 4],
    pub radiance: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDiskLight {
    pub center_radius: [f32; 4],
    pub normal: [f32; 4],
    pub radiance: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMeshLight {
    pub aabb_min: [f32; 4],
    pub aabb_max: [f32; 4],
    pub radiance: [f32; 4],
    pub mesh: u32,
    pub triangle_offset: u32,
    pub triangle_count: u32,
    pub _pad: u32,
}

#[inline]
fn vec4(v: Vec3, w: f32) -> [f32; 4] {
    [v.x, v.y, v.z, w]
}

macro_rules! cluster_access {
    ($field:ident) => {
        fn cluster(clusters: &LightClusters) -> &LightCluster<Self> {
            &clusters.$field
        }

        fn cluster_mut(clusters: &mut LightClusters) -> &mut LightCluster<Self> {
            &mut clusters.$field
        }
    };
}

impl Light for PointLight {
    const TYPE: LightType = LightType::Point;
    type Gpu = GpuPointLight;

    fn to_gpu(&self) -> GpuPointLight {
        GpuPointLight {
            position_radius: vec4(self.position, self.radius),
            radiance: vec4(self.radiance, 0.0),
        }
    }

    fn bounds(&self) -> Aabb {
        Aabb::from_center_extent(self.position, Vec3::splat(self.radius))
    }

    cluster_access!(point);
}

impl Light for SpotLight {
    const TYPE: LightType = LightType::Spot;
    type Gpu = GpuSpotLight;

    fn to_gpu(&self) -> GpuSpotLight {
        GpuSpotLight {
            position_radius: vec4(self.position, self.radius),
            direction_cos: vec4(self.direction.normalize_or_zero(), self.angle.cos()),
            radiance: vec4(self.radiance, 0.0),
        }
    }

    // The emitter itself is a sphere; the cone only shapes its emission.
    fn bounds(&self) -> Aabb {
        Aabb::from_center_extent(self.position, Vec3::splat(self.radius))
    }

    cluster_access!(spot);
}

impl Light for AreaLight {
    const TYPE: LightType = LightType::Area;
    type Gpu = GpuAreaLight;

    fn to_gpu(&self) -> GpuAreaLight {
        GpuAreaLight {
            center: vec4(self.center, 0.0),
            u: vec4(self.u, 0.0),
            v: vec4(self.v, 0.0),
            radiance: vec4(self.radiance, 0.0),
        }
    }

    fn bounds(&self) -> Aabb {
        Aabb::from_center_extent(self.center, self.u.abs() + self.v.abs())
    }

    cluster_access!(area);
}

impl Light for DiskLight {
    const TYPE: LightType = LightType::Disk;
    type Gpu = GpuDiskLight;

    fn to_gpu(&self) -> GpuDiskLight {
        GpuDiskLight {
            center_radius: vec4(self.center, self.radius),
            normal: vec4(self.normal.normalize_or_zero(), 0.0),
            radiance: vec4(self.radiance, 0.0),
        }
    }

    fn bounds(&self) -> Aabb {
        let n = self.normal.normalize_or_zero();
        let half = (Vec3::ONE - n * n).max(Vec3::ZERO);
        let half = Vec3::new(half.x.sqrt(), half.y.sqrt(), half.z.sqrt()) * self.radius;
        Aabb::from_center_extent(self.center, half)
    }

    cluster_access!(disk);
}

impl Light for MeshLight {
    const TYPE: LightType = LightType::Mesh;
    type Gpu = GpuMeshLight;

    fn to_gpu(&self) -> GpuMeshLight {
        GpuMeshLight {
            aabb_min: vec4(self.bounds.min, 0.0),
            aabb_max: vec4(self.bounds.max, 0.0),
            radiance: vec4(self.radiance, 0.0),
            mesh: self.mesh,
            triangle_offset: self.triangle_offset,
            triangle_count: self.triangle_count,
            _pad: 0,
        }
    }

    fn bounds(&self) -> Aabb {
        self.bounds
    }

    cluster_access!(mesh);
}

/// Opaque handle of a light of type `L`.
pub struct LightId<L> {
    key: LightKey,
    _marker: PhantomData<fn() -> L>,
}

impl<L> LightId<L> {
    fn new(key: LightKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }
}

impl<L> Clone for LightId<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L> Copy for LightId<L> {}

impl<L> PartialEq for LightId<L> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<L> Eq for LightId<L> {}

impl<L> std::fmt::Debug for LightId<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LightId").field(&self.key).finish()
    }
}

/// Tells the owner of a per-user-id indirection table that `transformed_user_id`
/// now lives at `new_light_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapBackCmd {
    pub transformed_user_id: u32,
    pub new_light_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LightRecord<L> {
    pub light: L,
    pub user_id: u32,
    /// BVH leaf node of this light, valid after the last rebuild.
    pub leaf: u32,
}

pub struct LightCluster<L: Light> {
    table: IndexedTable<LightKey, LightRecord<L>>,
    gpu: DeviceArray<L::Gpu>,
}

impl<L: Light> LightCluster<L> {
    fn new(device: &dyn GpuDevice, label: &'static str, capacity: u32) -> Result<Self> {
        Ok(Self {
            table: IndexedTable::with_capacity(capacity as usize),
            gpu: DeviceArray::new(device, label, capacity)?,
        })
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
    pub fn buffer(&self) -> crate::device::BufferHandle {
        self.gpu.buffer()
    }

    pub fn get(&self, id: LightId<L>) -> Option<&LightRecord<L>> {
        self.table.get(id.key)
    }

    pub fn index_of(&self, id: LightId<L>) -> Option<u32> {
        self.table.index_of(id.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LightRecord<L>> + '_ {
        self.table.iter().map(|(_, r)| r)
    }
}

/// GPU layout of one light BVH node.
///
/// Interior: `a` = left child, `b` = right child.
/// Leaf: `a` = light index inside its cluster, `b` = `LEAF_FLAG | light type`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightBvhNode {
    pub min: [f32; 3],
    pub a: u32,
    pub max: [f32; 3],
    pub b: u32,
}

impl LightBvhNode {
    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from_array(self.min), Vec3::from_array(self.max))
    }

    #[inline]
    fn set_bounds(&mut self, bounds: Aabb) {
        self.min = bounds.min.to_array();
        self.max = bounds.max.to_array();
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.b & LEAF_FLAG != 0
    }

    /// Light type and cluster index of a leaf.
    pub fn leaf_light(&self) -> Option<(LightType, u32)> {
        if !self.is_leaf() {
            return None;
        }
        Some((LightType::from_bits(self.b & !LEAF_FLAG)?, self.a))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasUpdate {
    Rebuilt,
    Refit,
    Unchanged,
}

struct Prim {
    bounds: Aabb,
    ty: LightType,
    index: u32,
}

/// All five light clusters plus the light BVH over them.
pub struct LightClusters {
    device: Arc<dyn GpuDevice>,
    point: LightCluster<PointLight>,
    spot: LightCluster<SpotLight>,
    area: LightCluster<AreaLight>,
    disk: LightCluster<DiskLight>,
    mesh: LightCluster<MeshLight>,

    nodes: Vec<LightBvhNode>,
    parents: Vec<u32>,
    node_gpu: DeviceArray<LightBvhNode>,
    needs_rebuild: bool,
    dirty_leaves: BTreeSet<u32>,
}

impl LightClusters {
    pub fn new(device: Arc<dyn GpuDevice>, capacity: u32) -> Result<Self> {
        let d = device.as_ref();
        let point = LightCluster::new(d, "point lights", capacity)?;
        let spot = LightCluster::new(d, "spot lights", capacity)?;
        let area = LightCluster::new(d, "area lights", capacity)?;
        let disk = LightCluster::new(d, "disk lights", capacity)?;
        let mesh = LightCluster::new(d, "mesh lights", capacity)?;
        let node_gpu = DeviceArray::new(d, "light bvh", capacity.saturating_mul(2))?;

        Ok(Self {
            device,
            point,
            spot,
            area,
            disk,
            mesh,
            nodes: Vec::new(),
            parents: Vec::new(),
            node_gpu,
            needs_rebuild: false,
            dirty_leaves: BTreeSet::new(),
        })
    }

    #[inline]
    pub fn cluster<L: Light>(&self) -> &LightCluster<L> {
        L::cluster(self)
    }

    pub fn emplace<L: Light>(&mut self, batcher: &mut UploadBatcher, light: L, user_id: u32) -> Result<LightId<L>> {
        let device = self.device.clone();
        let cluster = L::cluster_mut(self);
        let live = cluster.table.len() as u32;
        cluster.gpu.reserve(device.as_ref(), batcher, live + 1, live)?;

        let (key, index) = cluster.table.emplace(LightRecord {
            light,
            user_id,
            leaf: BVH_NONE,
        });
        cluster.gpu.stage(batcher, index, &[light.to_gpu()]);

        self.needs_rebuild = true;
        tracing::trace!(ty = ?L::TYPE, index, user_id, "light added");
        Ok(LightId::new(key))
    }

    /// Replaces the light's parameters and marks its leaf for refit.
    pub fn update<L: Light>(&mut self, batcher: &mut UploadBatcher, id: LightId<L>, light: L) -> bool {
        let cluster = L::cluster_mut(self);
        let Some(index) = cluster.table.index_of(id.key) else {
            debug_assert!(false, "update of unknown light {id:?}");
            tracing::warn!(ty = ?L::TYPE, "update of unknown light ignored");
            return false;
        };
        if let Some(record) = cluster.table.get_mut(id.key) {
            record.light = light;
        }
        cluster.gpu.stage(batcher, index, &[light.to_gpu()]);

        self.mark_light_dirty(L::TYPE, index);
        true
    }

    /// Swap-removes the light. Returns the relocation of the light that took its slot.
    pub fn remove<L: Light>(&mut self, batcher: &mut UploadBatcher, id: LightId<L>) -> Option<SwapBackCmd> {
        let cluster = L::cluster_mut(self);
        let Some(removed) = cluster.table.remove(id.key) else {
            debug_assert!(false, "removal of unknown light {id:?}");
            tracing::warn!(ty = ?L::TYPE, "removal of unknown light ignored");
            return None;
        };

        let swap = removed.moved.and_then(|moved| {
            let record = cluster.table.get(moved.key)?;
            cluster.gpu.stage(batcher, moved.new_index, &[record.light.to_gpu()]);
            Some(SwapBackCmd {
                transformed_user_id: record.user_id,
                new_light_index: moved.new_index,
            })
        });

        self.needs_rebuild = true;
        swap
    }

    /// Flags the leaf of light `index` of `ty` for refit.
    pub fn mark_light_dirty(&mut self, ty: LightType, index: u32) {
        if self.needs_rebuild {
            return;
        }
        match self.leaf_of(ty, index) {
            Some(leaf) if leaf != BVH_NONE => {
                self.dirty_leaves.insert(leaf);
            }
            _ => self.needs_rebuild = true,
        }
    }

    fn leaf_of(&self, ty: LightType, index: u32) -> Option<u32> {
        match ty {
            LightType::Point => self.point.table.get_at(index).map(|r| r.leaf),
            LightType::Spot => self.spot.table.get_at(index).map(|r| r.leaf),
            LightType::Area => self.area.table.get_at(index).map(|r| r.leaf),
            LightType::Disk => self.disk.table.get_at(index).map(|r| r.leaf),
            LightType::Mesh => self.mesh.table.get_at(index).map(|r| r.leaf),
        }
    }

    fn light_bounds(&self, ty: LightType, index: u32) -> Option<Aabb> {
        match ty {
            LightType::Point => self.point.table.get_at(index).map(|r| r.light.bounds()),
            LightType::Spot => self.spot.table.get_at(index).map(|r| r.light.bounds()),
            LightType::Area => self.area.table.get_at(index).map(|r| r.light.bounds()),
            LightType::Disk => self.disk.table.get_at(index).map(|r| r.light.bounds()),
            LightType::Mesh => self.mesh.table.get_at(index).map(|r| r.light.bounds()),
        }
    }

    fn set_leaf(&mut self, ty: LightType, index: u32, leaf: u32) {
        let record_leaf = match ty {
            LightType::Point => self.point.table.get_at_mut(index).map(|r| &mut r.leaf),
            LightType::Spot => self.spot.table.get_at_mut(index).map(|r| &mut r.leaf),
            LightType::Area => self.area.table.get_at_mut(index).map(|r| &mut r.leaf),
            LightType::Disk => self.disk.table.get_at_mut(index).map(|r| &mut r.leaf),
            LightType::Mesh => self.mesh.table.get_at_mut(index).map(|r| &mut r.leaf),
        };
        if let Some(slot) = record_leaf {
            *slot = leaf;
        }
    }

    fn collect_prims(&self) -> Vec<Prim> {
        fn push<L: Light>(out: &mut Vec<Prim>, cluster: &LightCluster<L>) {
            out.extend(cluster.table.iter().enumerate().map(|(i, (_, r))| Prim {
                bounds: r.light.bounds(),
                ty: L::TYPE,
                index: i as u32,
            }));
        }

        let mut prims = Vec::with_capacity(self.len());
        push(&mut prims, &self.point);
        push(&mut prims, &self.spot);
        push(&mut prims, &self.area);
        push(&mut prims, &self.disk);
        push(&mut prims, &self.mesh);
        prims
    }

    /// Rebuilds the BVH from scratch: one leaf per light, longest-axis median split.
    pub fn build_tlas(&mut self) {
        let prims = self.collect_prims();
        let mut order: Vec<usize> = (0..prims.len()).collect();

        self.nodes.clear();
        self.parents.clear();
        if !order.is_empty() {
            build_node(&mut self.nodes, &mut self.parents, &prims, &mut order, BVH_NONE);
        }

        let leaves: Vec<(LightType, u32, u32)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.leaf_light().map(|(ty, index)| (ty, index, i as u32)))
            .collect();
        for (ty, index, leaf) in leaves {
            self.set_leaf(ty, index, leaf);
        }

        self.needs_rebuild = false;
        self.dirty_leaves.clear();
        tracing::debug!(lights = prims.len(), nodes = self.nodes.len(), "light bvh rebuilt");
    }

    /// Refits dirty leaves and their ancestors. Returns the touched node indices.
    pub fn update_tlas(&mut self) -> BTreeSet<u32> {
        let mut touched = BTreeSet::new();

        for leaf in std::mem::take(&mut self.dirty_leaves) {
            let Some((ty, index)) = self.nodes.get(leaf as usize).and_then(LightBvhNode::leaf_light) else {
                continue;
            };
            let Some(bounds) = self.light_bounds(ty, index) else {
                continue;
            };
            self.nodes[leaf as usize].set_bounds(bounds);
            touched.insert(leaf);

            let mut n = self.parents[leaf as usize];
            while n != BVH_NONE {
                let node = self.nodes[n as usize];
                let merged = self.nodes[node.a as usize]
                    .bounds()
                    .union(self.nodes[node.b as usize].bounds());
                self.nodes[n as usize].set_bounds(merged);
                touched.insert(n);
                n = self.parents[n as usize];
            }
        }

        touched
    }

    /// Picks rebuild, refit, or nothing, stages node uploads, and moves growth
    /// copies of every light buffer into `list`.
    pub fn prepare(
        &mut self,
        batcher: &mut UploadBatcher,
        list: &mut CommandList,
        dispose: &mut DisposeQueue,
    ) -> Result<TlasUpdate> {
        let update = if self.needs_rebuild {
            self.build_tlas();
            let count = self.nodes.len() as u32;
            self.node_gpu
                .reserve(self.device.as_ref(), batcher, count, 0)?;
            self.node_gpu.stage(batcher, 0, &self.nodes);
            TlasUpdate::Rebuilt
        } else if !self.dirty_leaves.is_empty() {
            for n in self.update_tlas() {
                self.node_gpu
                    .stage(batcher, n, std::slice::from_ref(&self.nodes[n as usize]));
            }
            TlasUpdate::Refit
        } else {
            TlasUpdate::Unchanged
        };

        self.point.gpu.flush(list, dispose);
        self.spot.gpu.flush(list, dispose);
        self.area.gpu.flush(list, dispose);
        self.disk.gpu.flush(list, dispose);
        self.mesh.gpu.flush(list, dispose);
        self.node_gpu.flush(list, dispose);

        Ok(update)
    }

    pub fn nodes(&self) -> &[LightBvhNode] {
        &self.nodes
    }

    pub fn node_buffer(&self) -> crate::device::BufferHandle {
        self.node_gpu.buffer()
    }

    pub fn root_bounds(&self) -> Option<Aabb> {
        self.nodes.first().map(LightBvhNode::bounds)
    }

    /// Total number of lights over all clusters.
    pub fn len(&self) -> usize {
        self.point.len() + self.spot.len() + self.area.len() + self.disk.len() + self.mesh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn release(&mut self, dispose: &mut DisposeQueue) {
        self.point.gpu.release(dispose);
        self.spot.gpu.release(dispose);
        self.area.gpu.release(dispose);
        self.disk.gpu.release(dispose);
        self.mesh.gpu.release(dispose);
        self.node_gpu.release(dispose);
    }
}

fn build_node(
    nodes: &mut Vec<LightBvhNode>,
    parents: &mut Vec<u32>,
    prims: &[Prim],
    order: &mut [usize],
    parent: u32,
) -> u32 {
    let bounds = order
        .iter()
        .fold(Aabb::EMPTY, |acc, &i| acc.union(prims[i].bounds));

    let node_index = nodes.len() as u32;
    let mut node = LightBvhNode::zeroed();
    node.set_bounds(bounds);
    nodes.push(node);
    parents.push(parent);

    if let [only] = order {
        let prim = &prims[*only];
        nodes[node_index as usize].a = prim.index;
        nodes[node_index as usize].b = LEAF_FLAG | prim.ty as u32;
        return node_index;
    }

    let extent = bounds.extent();
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };

    order.sort_by(|&a, &b| {
        let ca = prims[a].bounds.center()[axis];
        let cb = prims[b].bounds.center()[axis];
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mid = order.len() / 2;
    let (lo, hi) = order.split_at_mut(mid);
    let left = build_node(nodes, parents, prims, lo, node_index);
    let right = build_node(nodes, parents, prims, hi, node_index);

    let node = &mut nodes[node_index as usize];
    node.a = left;
    node.b = right;
    node_index
}
