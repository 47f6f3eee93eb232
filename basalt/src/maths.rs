use bytemuck::{Pod, Zeroable};
pub use ultraviolet as uv;

pub type Vec3 = uv::Vec3;
pub type UVec3 = uv::UVec3;
pub type Vec4 = uv::Vec4;

pub type Mat4 = uv::Mat4;
pub type Rotor3 = uv::Rotor3;
pub type Isometry3 = uv::Isometry3;
pub type Similarity3 = uv::Similarity3;

/// Row-major 3x4 affine transform, the layout ray tracing instances expect.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct TransposedTransform3(pub [f32; 12]);

impl TransposedTransform3 {
    pub const IDENTITY: Self = Self([1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);

    pub fn from_matrix(m: &Mat4) -> Self {
        let c = &m.cols;
        Self([
            c[0].x, c[1].x, c[2].x, c[3].x, //
            c[0].y, c[1].y, c[2].y, c[3].y, //
            c[0].z, c[1].z, c[2].z, c[3].z,
        ])
    }

    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.0[3], self.0[7], self.0[11])
    }
}

impl Default for TransposedTransform3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Similarity3> for TransposedTransform3 {
    fn from(s: Similarity3) -> Self {
        Self::from_matrix(&s.into_homogeneous_matrix())
    }
}

impl From<Isometry3> for TransposedTransform3 {
    fn from(i: Isometry3) -> Self {
        Self::from_matrix(&i.into_homogeneous_matrix())
    }
}
