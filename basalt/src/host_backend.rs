use crate::{backend::*, error::BuildError, geometry::*, resource::*};
use parking_lot::Mutex;
use std::{collections::HashSet, thread, time::Duration};
use strum::IntoStaticStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum AccelKind {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyEvent {
    Accel(AccelHandle),
    Buffer(BufferHandle),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub bottom_builds: u64,
    pub top_builds: u64,
    pub failed_builds: u64,
    pub accel_destroys: u64,
    pub buffer_destroys: u64,
    /// Destroy calls on handles that were stale or already destroyed.
    pub invalid_destroys: u64,
}

struct AccelRecord {
    kind: AccelKind,
    _address: DeviceAddress,
}

struct BufferRecord {
    _size: u64,
}

struct HostState {
    accels: ResourceArray<AccelRecord>,
    buffers: ResourceArray<BufferRecord>,
    next_address: u64,
    fail_bottom: u32,
    fail_top: u32,
    fail_geometry: HashSet<GeometryId>,
    stats: HostStats,
    destroyed: Vec<DestroyEvent>,
}

impl HostState {
    fn allocate_address(&mut self, size: u64) -> DeviceAddress {
        let address = self.next_address;
        self.next_address += (size.max(1) + 0xff) & !0xff;
        DeviceAddress(address)
    }

    fn allocate_buffer(&mut self, size: u64) -> Result<BufferHandle, BuildError> {
        self.buffers
            .allocate(BufferRecord { _size: size })
            .map(|handle| BufferHandle::new(handle.into_raw()))
            .ok_or(BuildError::OutOfDeviceMemory)
    }

    fn allocate_accel(&mut self, kind: AccelKind, size: u64) -> Result<(AccelHandle, DeviceAddress), BuildError> {
        let address = self.allocate_address(size);
        self.accels
            .allocate(AccelRecord { kind, _address: address })
            .map(|handle| (AccelHandle::new(handle.into_raw()), address))
            .ok_or(BuildError::OutOfDeviceMemory)
    }

    fn free_buffer(&mut self, buffer: BufferHandle) {
        if let Some(handle) = ResourceHandle::from_raw(buffer.raw()) {
            self.buffers.free(handle);
        }
    }

    fn free_accel(&mut self, handle: AccelHandle) -> Option<AccelKind> {
        ResourceHandle::from_raw(handle.raw())
            .and_then(|h| self.accels.free(h))
            .map(|record| record.kind)
    }

    fn take_failure(&mut self, kind: AccelKind, id: Option<GeometryId>) -> Option<BuildError> {
        let counter = match kind {
            AccelKind::Bottom => &mut self.fail_bottom,
            AccelKind::Top => &mut self.fail_top,
        };
        let fail = if *counter > 0 {
            *counter -= 1;
            true
        } else {
            id.map_or(false, |id| self.fail_geometry.contains(&id))
        };
        if fail {
            self.stats.failed_builds += 1;
            Some(BuildError::OutOfDeviceMemory)
        } else {
            None
        }
    }
}

/// Build backend that simulates driver builds on the host.
///
/// Handles come from fixed-size generation-checked arrays so that leaks and double
/// destruction show up in `live_accels`, `live_buffers` and `stats().invalid_destroys`.
pub struct HostBackend {
    state: Mutex<HostState>,
    latency: Duration,
    instance_limit: usize,
}

impl HostBackend {
    pub const DEFAULT_CAPACITY: usize = 16 * 1024;
    pub const DEFAULT_INSTANCE_LIMIT: usize = 1 << 24;

    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(HostState {
                accels: ResourceArray::new(capacity),
                buffers: ResourceArray::new(2 * capacity),
                next_address: 0x1_0000,
                fail_bottom: 0,
                fail_top: 0,
                fail_geometry: HashSet::new(),
                stats: HostStats::default(),
                destroyed: Vec::new(),
            }),
            latency: Duration::ZERO,
            instance_limit: Self::DEFAULT_INSTANCE_LIMIT,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_instance_limit(mut self, instance_limit: usize) -> Self {
        self.instance_limit = instance_limit;
        self
    }

    pub fn fail_next_bottom_builds(&self, count: u32) {
        self.state.lock().fail_bottom += count;
    }

    pub fn fail_next_top_builds(&self, count: u32) {
        self.state.lock().fail_top += count;
    }

    pub fn fail_geometry(&self, id: GeometryId) {
        self.state.lock().fail_geometry.insert(id);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_bottom = 0;
        state.fail_top = 0;
        state.fail_geometry.clear();
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats.clone()
    }

    pub fn live_accels(&self) -> usize {
        self.state.lock().accels.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn destroy_events(&self) -> Vec<DestroyEvent> {
        self.state.lock().destroyed.clone()
    }

    pub fn was_destroyed(&self, handle: AccelHandle) -> bool {
        self.state
            .lock()
            .destroyed
            .iter()
            .any(|event| *event == DestroyEvent::Accel(handle))
    }

    fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl BuildBackend for HostBackend {
    fn build_bottom(&self, geometry: &GeometryDesc) -> Result<BottomBuild, BuildError> {
        let mesh = &geometry.mesh;
        if mesh.triangle_count() == 0 {
            return Err(BuildError::InvalidGeometry {
                id: geometry.id,
                reason: "mesh has no triangles".to_owned(),
            });
        }
        if let Some(index) = mesh.indices.iter().flat_map(|t| [t.x, t.y, t.z]).find(|&i| i >= mesh.vertex_count()) {
            return Err(BuildError::InvalidGeometry {
                id: geometry.id,
                reason: format!("index {} out of range for {} vertices", index, mesh.vertex_count()),
            });
        }

        self.simulate_latency();

        let mut state = self.state.lock();
        if let Some(err) = state.take_failure(AccelKind::Bottom, Some(geometry.id)) {
            return Err(err);
        }
        let size = 64 * u64::from(mesh.triangle_count());
        let buffer = state.allocate_buffer(size)?;
        let (handle, device_address) = match state.allocate_accel(AccelKind::Bottom, size) {
            Ok(pair) => pair,
            Err(err) => {
                state.free_buffer(buffer);
                return Err(err);
            }
        };
        state.stats.bottom_builds += 1;
        Ok(BottomBuild {
            handle,
            buffer,
            device_address,
        })
    }

    fn build_top(&self, instances: &[InstancePlacement]) -> Result<TopBuild, BuildError> {
        if instances.len() > self.instance_limit {
            return Err(BuildError::InstanceLimit {
                count: instances.len(),
                limit: self.instance_limit,
            });
        }

        self.simulate_latency();

        let mut state = self.state.lock();
        if let Some(err) = state.take_failure(AccelKind::Top, None) {
            return Err(err);
        }
        let size = 128 * instances.len() as u64;
        let instance_buffer = state.allocate_buffer(64 * instances.len() as u64)?;
        let buffer = match state.allocate_buffer(size) {
            Ok(buffer) => buffer,
            Err(err) => {
                state.free_buffer(instance_buffer);
                return Err(err);
            }
        };
        let (handle, device_address) = match state.allocate_accel(AccelKind::Top, size) {
            Ok(pair) => pair,
            Err(err) => {
                state.free_buffer(buffer);
                state.free_buffer(instance_buffer);
                return Err(err);
            }
        };
        state.stats.top_builds += 1;
        Ok(TopBuild {
            handle,
            buffer,
            instance_buffer,
            device_address,
        })
    }

    fn destroy_accel(&self, handle: AccelHandle) {
        let mut state = self.state.lock();
        match state.free_accel(handle) {
            Some(kind) => {
                log::trace!("destroyed {} accel {:#x}", <&'static str>::from(kind), handle.raw());
                state.stats.accel_destroys += 1;
                state.destroyed.push(DestroyEvent::Accel(handle));
            }
            None => {
                log::error!("destroy of unknown or stale accel {:#x}", handle.raw());
                state.stats.invalid_destroys += 1;
            }
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        let freed = ResourceHandle::from_raw(buffer.raw()).and_then(|h| state.buffers.free(h)).is_some();
        if freed {
            state.stats.buffer_destroys += 1;
            state.destroyed.push(DestroyEvent::Buffer(buffer));
        } else {
            log::error!("destroy of unknown or stale buffer {:#x}", buffer.raw());
            state.stats.invalid_destroys += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maths::*;
    use std::sync::Arc;

    fn quad(id: u32) -> GeometryDesc {
        let mesh = Mesh::default().with_quad(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        GeometryDesc::new(GeometryId(id), Arc::new(mesh))
    }

    #[test]
    fn build_and_destroy_leaves_nothing_live() {
        let backend = HostBackend::new(8);
        let bottom = backend.build_bottom(&quad(0)).unwrap();
        assert!(!bottom.device_address.is_null());
        let placement = InstanceDesc::new(quad(0), Similarity3::identity()).placement(bottom.device_address);
        let top = backend.build_top(&[placement]).unwrap();
        assert_eq!(backend.live_accels(), 2);
        assert_eq!(backend.live_buffers(), 3);

        backend.destroy_accel(top.handle);
        backend.destroy_buffer(top.buffer);
        backend.destroy_buffer(top.instance_buffer);
        backend.destroy_accel(bottom.handle);
        backend.destroy_buffer(bottom.buffer);
        assert_eq!(backend.live_accels(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert!(backend.was_destroyed(bottom.handle));
        assert_eq!(backend.stats().invalid_destroys, 0);
    }

    #[test]
    fn double_destroy_is_counted() {
        let backend = HostBackend::new(8);
        let bottom = backend.build_bottom(&quad(0)).unwrap();
        backend.destroy_accel(bottom.handle);
        backend.destroy_accel(bottom.handle);
        assert_eq!(backend.stats().invalid_destroys, 1);
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let backend = HostBackend::new(8);
        backend.fail_next_bottom_builds(1);
        assert_eq!(backend.build_bottom(&quad(0)), Err(BuildError::OutOfDeviceMemory));
        assert!(backend.build_bottom(&quad(0)).is_ok());

        backend.fail_geometry(GeometryId(4));
        assert!(backend.build_bottom(&quad(4)).is_err());
        assert!(backend.build_bottom(&quad(5)).is_ok());
        backend.clear_failures();
        assert!(backend.build_bottom(&quad(4)).is_ok());
        assert_eq!(backend.stats().failed_builds, 2);
    }

    #[test]
    fn rejects_empty_mesh_and_instance_overflow() {
        let backend = HostBackend::new(8).with_instance_limit(1);
        let empty = GeometryDesc::new(GeometryId(2), Arc::new(Mesh::default()));
        assert!(matches!(
            backend.build_bottom(&empty),
            Err(BuildError::InvalidGeometry { id: GeometryId(2), .. })
        ));
        let placement = InstancePlacement {
            transform: TransposedTransform3::IDENTITY,
            instance_custom_index_and_mask: 0,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: 0x100,
        };
        assert_eq!(
            backend.build_top(&[placement, placement]),
            Err(BuildError::InstanceLimit { count: 2, limit: 1 })
        );
    }

    #[test]
    fn exhausted_arrays_report_out_of_memory() {
        let backend = HostBackend::new(1);
        let _first = backend.build_bottom(&quad(0)).unwrap();
        assert_eq!(backend.build_bottom(&quad(1)), Err(BuildError::OutOfDeviceMemory));
        assert_eq!(backend.live_buffers(), 1);
    }
}
