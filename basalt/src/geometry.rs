use crate::maths::*;
use crate::resource::DeviceAddress;
use bytemuck::{Pod, Zeroable};
use std::{
    fmt, ops, ptr,
    sync::{Arc, Weak},
};

/// Stable identity of a renderable geometry, used to index the bottom structure registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeometryId(pub u32);

impl GeometryId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GeometryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub indices: Vec<UVec3>,
}

impl Mesh {
    pub fn with_quad(mut self, v0: Vec3, v1: Vec3, v2: Vec3, v3: Vec3) -> Self {
        let base = UVec3::broadcast(self.positions.len() as u32);
        self.positions.push(v0);
        self.positions.push(v1);
        self.positions.push(v2);
        self.positions.push(v3);
        self.indices.push(base + UVec3::new(0, 1, 2));
        self.indices.push(base + UVec3::new(2, 3, 0));
        self
    }

    pub fn with_box(self, min: Vec3, max: Vec3) -> Self {
        let v = |x: f32, y: f32, z: f32| Vec3::new(x, y, z);
        self.with_quad(v(min.x, min.y, min.z), v(max.x, min.y, min.z), v(max.x, min.y, max.z), v(min.x, min.y, max.z))
            .with_quad(v(min.x, max.y, min.z), v(min.x, max.y, max.z), v(max.x, max.y, max.z), v(max.x, max.y, min.z))
            .with_quad(v(min.x, min.y, min.z), v(min.x, max.y, min.z), v(max.x, max.y, min.z), v(max.x, min.y, min.z))
            .with_quad(v(min.x, min.y, max.z), v(max.x, min.y, max.z), v(max.x, max.y, max.z), v(min.x, max.y, max.z))
            .with_quad(v(min.x, min.y, min.z), v(min.x, min.y, max.z), v(min.x, max.y, max.z), v(min.x, max.y, min.z))
            .with_quad(v(max.x, min.y, min.z), v(max.x, max.y, min.z), v(max.x, max.y, max.z), v(max.x, min.y, max.z))
    }

    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// Remembers which mesh allocation a structure was built from.
///
/// Holding the `Weak` keeps the allocation address reserved, so a reloaded mesh
/// can never be mistaken for the one it replaced.
#[derive(Debug, Clone)]
pub struct MeshIdentity(Weak<Mesh>);

impl MeshIdentity {
    pub fn of(mesh: &Arc<Mesh>) -> Self {
        Self(Arc::downgrade(mesh))
    }

    pub fn matches(&self, mesh: &Arc<Mesh>) -> bool {
        ptr::eq(self.0.as_ptr(), Arc::as_ptr(mesh))
    }
}

#[derive(Debug, Clone)]
pub struct GeometryDesc {
    pub id: GeometryId,
    pub mesh: Arc<Mesh>,
}

impl GeometryDesc {
    pub fn new(id: GeometryId, mesh: Arc<Mesh>) -> Self {
        Self { id, mesh }
    }

    pub fn identity(&self) -> MeshIdentity {
        MeshIdentity::of(&self.mesh)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceFlags(u8);

impl InstanceFlags {
    pub const TRIANGLE_FACING_CULL_DISABLE: Self = Self(0x1);
    pub const TRIANGLE_FLIP_FACING: Self = Self(0x2);
    pub const FORCE_OPAQUE: Self = Self(0x4);
    pub const FORCE_NO_OPAQUE: Self = Self(0x8);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for InstanceFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One placement of a geometry in a top structure, as supplied by the scene.
#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub geometry: GeometryDesc,
    pub transform: Similarity3,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_offset: u32,
    pub flags: InstanceFlags,
}

impl InstanceDesc {
    pub const MAX_CUSTOM_INDEX: u32 = 0xff_ff_ff;
    pub const MAX_SBT_OFFSET: u32 = 0xff_ff_ff;

    pub fn new(geometry: GeometryDesc, transform: Similarity3) -> Self {
        Self {
            geometry,
            transform,
            custom_index: 0,
            mask: 0xff,
            sbt_offset: 0,
            flags: InstanceFlags::empty(),
        }
    }

    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_sbt_offset(mut self, sbt_offset: u32) -> Self {
        self.sbt_offset = sbt_offset;
        self
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn geometry_id(&self) -> GeometryId {
        self.geometry.id
    }

    pub fn placement(&self, reference: DeviceAddress) -> InstancePlacement {
        debug_assert!(self.custom_index <= Self::MAX_CUSTOM_INDEX, "custom index out of range");
        debug_assert!(self.sbt_offset <= Self::MAX_SBT_OFFSET, "SBT offset out of range");
        InstancePlacement {
            transform: self.transform.into(),
            instance_custom_index_and_mask: (self.custom_index & Self::MAX_CUSTOM_INDEX) | (u32::from(self.mask) << 24),
            instance_shader_binding_table_record_offset_and_flags: (self.sbt_offset & Self::MAX_SBT_OFFSET)
                | (u32::from(self.flags.bits()) << 24),
            acceleration_structure_reference: reference.0,
        }
    }
}

// vk::AccelerationStructureInstanceKHR with Pod trait
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct InstancePlacement {
    pub transform: TransposedTransform3,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl InstancePlacement {
    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & InstanceDesc::MAX_CUSTOM_INDEX
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & InstanceDesc::MAX_SBT_OFFSET
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags((self.instance_shader_binding_table_record_offset_and_flags >> 24) as u8)
    }

    pub fn reference(&self) -> DeviceAddress {
        DeviceAddress(self.acceleration_structure_reference)
    }
}
