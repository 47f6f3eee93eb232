use crate::{error::BuildError, geometry::*, resource::*};

/// Result of building one bottom structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BottomBuild {
    pub handle: AccelHandle,
    pub buffer: BufferHandle,
    pub device_address: DeviceAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopBuild {
    pub handle: AccelHandle,
    pub buffer: BufferHandle,
    pub instance_buffer: BufferHandle,
    pub device_address: DeviceAddress,
}

/// Synchronous driver-facing build calls.
///
/// Builds may block on driver work and are only ever called from worker pool threads.
pub trait BuildBackend: Send + Sync {
    fn build_bottom(&self, geometry: &GeometryDesc) -> Result<BottomBuild, BuildError>;

    fn build_top(&self, instances: &[InstancePlacement]) -> Result<TopBuild, BuildError>;

    fn destroy_accel(&self, handle: AccelHandle);

    fn destroy_buffer(&self, buffer: BufferHandle);
}

